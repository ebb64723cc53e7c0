//! Reader configuration
//!
//! [`ReaderParameters`] describes one build directory: where the sources and
//! build live, which cmake binary and generator to use and which cache
//! overrides to pass on configure.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::ReaderError;
use crate::model::cache::CacheEntryType;
use crate::model::paths::normalize_path;

/// Default cmake executable when neither CLI nor environment name one
pub const DEFAULT_CMAKE_EXECUTABLE: &str = "cmake";

/// Environment variable consulted for the cmake executable
pub const CMAKE_PATH_ENV: &str = "CMAKE_PATH";

/// Default generator, matching what cmake picks on most Unix hosts
pub const DEFAULT_GENERATOR: &str = "Unix Makefiles";

/// Name of the cache file whose absence forces cache arguments on configure
pub const CMAKE_CACHE_FILE: &str = "CMakeCache.txt";

/// Resolve the cmake executable: CLI argument > `CMAKE_PATH` > `cmake`
pub fn resolve_cmake_executable(cli_arg: Option<String>) -> String {
    cli_arg
        .or_else(|| std::env::var(CMAKE_PATH_ENV).ok())
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| DEFAULT_CMAKE_EXECUTABLE.to_string())
}

// ============================================================================
// Cache overrides
// ============================================================================

/// A cache variable override passed to configure as `-DKEY:TYPE=VALUE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub item_type: Option<CacheEntryType>,
    pub value: String,
}

fn config_item_pattern() -> Result<&'static Regex, ReaderError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?:-D)?([^:=\s]+)(?::([A-Za-z]+))?=(.*)$"))
        .as_ref()
        .map_err(|e| ReaderError::Pattern(e.clone()))
}

impl ConfigItem {
    pub fn new(key: impl Into<String>, item_type: Option<CacheEntryType>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            item_type,
            value: value.into(),
        }
    }

    /// Parse `KEY=VALUE`, `KEY:TYPE=VALUE`, optionally prefixed with `-D`
    pub fn parse(argument: &str) -> Result<Self, ReaderError> {
        let captures = config_item_pattern()?
            .captures(argument.trim())
            .ok_or_else(|| ReaderError::InvalidConfigItem {
                argument: argument.to_string(),
            })?;

        let key = captures[1].to_string();
        let item_type = captures.get(2).map(|t| CacheEntryType::from_wire(t.as_str()));
        let value = captures[3].to_string();

        Ok(Self {
            key,
            item_type,
            value,
        })
    }

    /// Command line form for the configure request
    pub fn to_argument(&self) -> String {
        match &self.item_type {
            Some(item_type) => format!("-D{}:{}={}", self.key, item_type.as_str(), self.value),
            None => format!("-D{}={}", self.key, self.value),
        }
    }
}

// ============================================================================
// Reader parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderParameters {
    pub cmake_executable: String,
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub generator: String,
    pub extra_generator: Option<String>,
    pub platform: Option<String>,
    pub toolset: Option<String>,
    /// Cache overrides sent with a forced configure
    pub configuration: Vec<ConfigItem>,
}

impl ReaderParameters {
    pub fn builder(source_directory: impl AsRef<Path>, build_directory: impl AsRef<Path>) -> ReaderParametersBuilder {
        ReaderParametersBuilder::new(source_directory.as_ref(), build_directory.as_ref())
    }

    /// Whether a running server for `self` can serve `other` without relaunch
    pub fn is_server_compatible(&self, other: &ReaderParameters) -> bool {
        self.cmake_executable == other.cmake_executable
            && self.source_directory == other.source_directory
            && self.build_directory == other.build_directory
            && self.generator == other.generator
            && self.extra_generator == other.extra_generator
            && self.platform == other.platform
            && self.toolset == other.toolset
    }

    pub fn cache_file(&self) -> PathBuf {
        self.build_directory.join(CMAKE_CACHE_FILE)
    }

    /// `cacheArguments` for configure. The leading empty entry mirrors what
    /// cmake's own clients send: the server drops the first argument.
    pub fn cache_arguments(&self) -> Vec<String> {
        std::iter::once(String::new())
            .chain(self.configuration.iter().map(ConfigItem::to_argument))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReaderParametersBuilder {
    parameters: ReaderParameters,
}

impl ReaderParametersBuilder {
    fn new(source_directory: &Path, build_directory: &Path) -> Self {
        Self {
            parameters: ReaderParameters {
                cmake_executable: DEFAULT_CMAKE_EXECUTABLE.to_string(),
                source_directory: normalize_path(source_directory),
                build_directory: normalize_path(build_directory),
                generator: DEFAULT_GENERATOR.to_string(),
                extra_generator: None,
                platform: None,
                toolset: None,
                configuration: Vec::new(),
            },
        }
    }

    pub fn cmake_executable(mut self, executable: impl Into<String>) -> Self {
        self.parameters.cmake_executable = executable.into();
        self
    }

    pub fn generator(mut self, generator: impl Into<String>) -> Self {
        self.parameters.generator = generator.into();
        self
    }

    pub fn extra_generator(mut self, extra_generator: impl Into<String>) -> Self {
        self.parameters.extra_generator = Some(extra_generator.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.parameters.platform = Some(platform.into());
        self
    }

    pub fn toolset(mut self, toolset: impl Into<String>) -> Self {
        self.parameters.toolset = Some(toolset.into());
        self
    }

    pub fn config_item(mut self, item: ConfigItem) -> Self {
        self.parameters.configuration.push(item);
        self
    }

    pub fn build(self) -> ReaderParameters {
        self.parameters
    }
}
