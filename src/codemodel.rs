//! Code-model projection
//!
//! Flattens the file groups of a snapshot into [`ProjectPart`]s, the shape a
//! completion or indexing engine consumes. A file compiled by several targets
//! shows up in several parts; [`CodeModel::file_settings`] returns all of them.

use json_compilation_db::Entry;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::model::{IncludePath, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectPart {
    pub project: String,
    pub target: String,
    pub language: String,
    pub compile_flags: Vec<String>,
    pub defines: Vec<String>,
    pub include_paths: Vec<IncludePath>,
    pub files: Vec<PathBuf>,
    pub build_directory: PathBuf,
    pub is_generated: bool,
}

/// How one part compiles a given file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSettings<'a> {
    pub target: &'a str,
    pub language: &'a str,
    pub compile_flags: &'a [String],
    pub defines: &'a [String],
    pub include_paths: &'a [IncludePath],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeModel {
    pub parts: Vec<ProjectPart>,
    /// Languages with at least one part; the empty tag is left out
    pub languages: BTreeSet<String>,
    /// `CMAKE_<LANG>_COMPILER` values from the cache
    pub compilers: BTreeMap<String, String>,
}

/// Split a flag string with shell quoting rules. Unbalanced quotes fall back
/// to plain whitespace splitting.
fn split_compile_flags(flags: &str, target: &str) -> Vec<String> {
    match shlex::split(flags) {
        Some(words) => words,
        None => {
            warn!("Unbalanced quotes in compile flags of {}: {}", target, flags);
            flags.split_whitespace().map(str::to_string).collect()
        }
    }
}

pub fn project_code_model(snapshot: &Snapshot) -> CodeModel {
    let model = &snapshot.model;
    let mut code_model = CodeModel::default();

    for (target_id, target) in model.targets() {
        let project = &model.project(target.project).name;
        for group in model.file_groups_of(target_id) {
            if group.sources.is_empty() {
                continue;
            }
            if !group.language.is_empty() {
                code_model.languages.insert(group.language.clone());
            }
            code_model.parts.push(ProjectPart {
                project: project.clone(),
                target: target.name.clone(),
                language: group.language.clone(),
                compile_flags: split_compile_flags(&group.compile_flags, &target.name),
                defines: group.defines.clone(),
                include_paths: group.include_paths.clone(),
                files: group.sources.clone(),
                build_directory: target.build_directory.clone(),
                is_generated: group.is_generated,
            });
        }
    }

    for language in &code_model.languages {
        let key = format!("CMAKE_{language}_COMPILER");
        if let Some(compiler) = snapshot.cache.value_of(&key).filter(|c| !c.is_empty()) {
            code_model.compilers.insert(language.clone(), compiler.to_string());
        }
    }

    code_model
}

impl CodeModel {
    /// Every record that compiles `path`, in part order
    pub fn file_settings(&self, path: &Path) -> Vec<FileSettings<'_>> {
        self.parts
            .iter()
            .flat_map(|part| {
                part.files
                    .iter()
                    .filter(move |file| file.as_path() == path)
                    .map(move |_| FileSettings {
                        target: &part.target,
                        language: &part.language,
                        compile_flags: &part.compile_flags,
                        defines: &part.defines,
                        include_paths: &part.include_paths,
                    })
            })
            .collect()
    }

    fn compiler_for(&self, language: &str) -> String {
        if let Some(compiler) = self.compilers.get(language) {
            return compiler.clone();
        }
        match language {
            "C" => "cc",
            "CXX" => "c++",
            _ => "cc",
        }
        .to_string()
    }

    /// Command line for one file of one part
    pub fn arguments(&self, part: &ProjectPart, file: &Path) -> Vec<String> {
        let mut arguments = vec![self.compiler_for(&part.language)];
        arguments.extend(part.compile_flags.iter().cloned());
        arguments.extend(part.defines.iter().map(|define| format!("-D{define}")));
        for include in &part.include_paths {
            let flag = if include.is_system { "-isystem" } else { "-I" };
            arguments.push(flag.to_string());
            arguments.push(include.path.display().to_string());
        }
        arguments.push("-c".to_string());
        arguments.push(file.display().to_string());
        arguments
    }

    /// `compile_commands.json` records, one per (part, file) pair. Parts
    /// without a language are not compiled and are left out.
    pub fn to_compile_commands(&self) -> Result<Vec<Entry>, serde_json::Error> {
        let mut entries = Vec::new();
        for part in self.parts.iter().filter(|part| !part.language.is_empty()) {
            for file in &part.files {
                let entry = json!({
                    "directory": part.build_directory,
                    "file": file,
                    "arguments": self.arguments(part, file),
                });
                entries.push(serde_json::from_value(entry)?);
            }
        }
        Ok(entries)
    }
}
