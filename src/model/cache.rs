//! CMake cache entries as reported by the `cache` reply

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cache variable type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CacheEntryType {
    Bool,
    String,
    FilePath,
    Path,
    Static,
    Internal,
    Uninitialized,
    Other(String),
}

impl CacheEntryType {
    pub fn from_wire(tag: &str) -> Self {
        match tag.to_ascii_uppercase().as_str() {
            "BOOL" => CacheEntryType::Bool,
            "STRING" => CacheEntryType::String,
            "FILEPATH" => CacheEntryType::FilePath,
            "PATH" => CacheEntryType::Path,
            "STATIC" => CacheEntryType::Static,
            "INTERNAL" => CacheEntryType::Internal,
            "UNINITIALIZED" => CacheEntryType::Uninitialized,
            _ => CacheEntryType::Other(tag.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CacheEntryType::Bool => "BOOL",
            CacheEntryType::String => "STRING",
            CacheEntryType::FilePath => "FILEPATH",
            CacheEntryType::Path => "PATH",
            CacheEntryType::Static => "STATIC",
            CacheEntryType::Internal => "INTERNAL",
            CacheEntryType::Uninitialized => "UNINITIALIZED",
            CacheEntryType::Other(tag) => tag,
        }
    }
}

impl From<String> for CacheEntryType {
    fn from(tag: String) -> Self {
        CacheEntryType::from_wire(&tag)
    }
}

impl From<CacheEntryType> for String {
    fn from(entry_type: CacheEntryType) -> Self {
        entry_type.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub entry_type: CacheEntryType,
    pub properties: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn is_advanced(&self) -> bool {
        self.properties.get("ADVANCED").is_some_and(|v| v == "1")
    }

    pub fn help_string(&self) -> Option<&str> {
        self.properties.get("HELPSTRING").map(String::as_str)
    }
}

/// The whole cache of one parse cycle, in reported order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmakeCache {
    pub entries: Vec<CacheEntry>,
}

impl CmakeCache {
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.get(key).map(|entry| entry.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries a user would normally edit: not internal, not static
    pub fn user_entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter().filter(|entry| {
            !matches!(
                entry.entry_type,
                CacheEntryType::Internal | CacheEntryType::Static
            )
        })
    }
}
