//! Payload extraction
//!
//! Turns the JSON payloads of the `codemodel`, `cache` and `cmakeInputs`
//! replies into model entities. Missing fields take their empty default. A
//! field of the wrong JSON type costs only the entity that holds it: the
//! entity is skipped, a [`Diagnostic`] is recorded and its siblings are still
//! extracted.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::cache::{CacheEntry, CacheEntryType, CmakeCache};
use super::paths::resolve_path;
use super::{
    CmakeInputFile, CmakeInputs, Diagnostic, FileGroupInfo, IncludePath, ProjectId, ProjectModel,
    TargetId, TargetInfo,
};

type Object = Map<String, Value>;

// ============================================================================
// Field access
// ============================================================================

fn wrong_type(field: &str, expected: &str, found: &Value) -> String {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    format!("field {field:?} should be {expected}, found {found}")
}

fn string_field(object: &Object, field: &str) -> Result<String, String> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(wrong_type(field, "a string", other)),
    }
}

fn bool_field(object: &Object, field: &str) -> Result<bool, String> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(wrong_type(field, "a bool", other)),
    }
}

fn array_field<'a>(object: &'a Object, field: &str) -> Result<&'a [Value], String> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(wrong_type(field, "an array", other)),
    }
}

fn string_list_field(object: &Object, field: &str) -> Result<Vec<String>, String> {
    array_field(object, field)?
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            other => Err(wrong_type(&format!("{field}[]"), "a string", other)),
        })
        .collect()
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Object, String> {
    value
        .as_object()
        .ok_or_else(|| wrong_type(what, "an object", value))
}

fn record(diagnostics: &mut Vec<Diagnostic>, context: String, message: String) {
    warn!("Skipping {}: {}", context, message);
    diagnostics.push(Diagnostic::new(context, message));
}

// ============================================================================
// Code model
// ============================================================================

/// Fill `model` from a `codemodel` reply payload
pub fn extract_code_model(payload: &Object, model: &mut ProjectModel, diagnostics: &mut Vec<Diagnostic>) {
    let configurations = match array_field(payload, "configurations") {
        Ok(configurations) => configurations,
        Err(message) => {
            record(diagnostics, "codemodel".to_string(), message);
            return;
        }
    };

    let Some(configuration) = configurations.first() else {
        debug!("Code model reply carries no configuration");
        return;
    };
    if configurations.len() > 1 {
        diagnostics.push(Diagnostic::new(
            "codemodel",
            format!(
                "{} configurations reported, only the first is used",
                configurations.len()
            ),
        ));
    }

    let configuration = match as_object(configuration, "configurations[0]") {
        Ok(configuration) => configuration,
        Err(message) => {
            record(diagnostics, "codemodel".to_string(), message);
            return;
        }
    };
    let projects = match array_field(configuration, "projects") {
        Ok(projects) => projects,
        Err(message) => {
            record(diagnostics, "configuration".to_string(), message);
            return;
        }
    };

    for (index, project) in projects.iter().enumerate() {
        let context = format!("project #{index}");
        if let Err(message) = extract_project(project, model, diagnostics) {
            record(diagnostics, context, message);
        }
    }

    debug!(
        "Extracted code model: {} projects, {} targets, {} file groups",
        model.project_count(),
        model.target_count(),
        model.file_group_count()
    );
}

fn extract_project(value: &Value, model: &mut ProjectModel, diagnostics: &mut Vec<Diagnostic>) -> Result<(), String> {
    let project = as_object(value, "project")?;
    let name = string_field(project, "name")?;
    let source_directory = resolve_path(Path::new(""), &string_field(project, "sourceDirectory")?);
    let targets = array_field(project, "targets")?;

    if model.project_by_name(&name).is_some() {
        record(
            diagnostics,
            format!("project {name:?}"),
            "duplicate project name".to_string(),
        );
        return Ok(());
    }

    let project_id = model.add_project(name.clone(), source_directory.clone());
    for (index, target) in targets.iter().enumerate() {
        if let Err(message) = extract_target(target, project_id, &source_directory, model, diagnostics) {
            record(diagnostics, format!("target #{index} of project {name:?}"), message);
        }
    }
    Ok(())
}

fn extract_target(
    value: &Value,
    project: ProjectId,
    project_source: &Path,
    model: &mut ProjectModel,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(), String> {
    let target = as_object(value, "target")?;
    let name = string_field(target, "name")?;

    let source_directory = match string_field(target, "sourceDirectory")?.as_str() {
        "" => project_source.to_path_buf(),
        dir => resolve_path(project_source, dir),
    };
    let build_directory = resolve_path(&source_directory, &string_field(target, "buildDirectory")?);
    let artifacts = string_list_field(target, "artifacts")?
        .iter()
        .map(|artifact| resolve_path(&build_directory, artifact))
        .collect();
    let file_groups = array_field(target, "fileGroups")?;

    let info = TargetInfo {
        full_name: string_field(target, "fullName")?,
        target_type: string_field(target, "type")?,
        linker_language: string_field(target, "linkerLanguage")?,
        name,
        artifacts,
        source_directory: source_directory.clone(),
        build_directory,
    };

    let target_id = model.add_target(project, info);
    for (index, group) in file_groups.iter().enumerate() {
        match extract_file_group(group, &source_directory) {
            Ok(info) => {
                model.add_file_group(target_id, info);
            }
            Err(message) => {
                let context = format!("file group #{index} of {}", target_path(model, target_id));
                record(diagnostics, context, message);
            }
        }
    }
    Ok(())
}

fn extract_include_paths(group: &Object, base: &Path) -> Result<Vec<IncludePath>, String> {
    // Protocol 1.0 names the list "includePath"
    let field = if group.contains_key("includePath") {
        "includePath"
    } else {
        "includePaths"
    };

    array_field(group, field)?
        .iter()
        .map(|entry| {
            let entry = as_object(entry, &format!("{field}[]"))?;
            Ok(IncludePath {
                path: resolve_path(base, &string_field(entry, "path")?),
                is_system: bool_field(entry, "isSystem")?,
            })
        })
        .collect()
}

fn extract_file_group(value: &Value, base: &Path) -> Result<FileGroupInfo, String> {
    let group = as_object(value, "fileGroup")?;

    Ok(FileGroupInfo {
        compile_flags: string_field(group, "compileFlags")?,
        defines: string_list_field(group, "defines")?,
        include_paths: extract_include_paths(group, base)?,
        language: string_field(group, "language")?,
        sources: string_list_field(group, "sources")?
            .iter()
            .map(|source| resolve_path(base, source))
            .collect(),
        is_generated: bool_field(group, "isGenerated")?,
    })
}

// ============================================================================
// Cache
// ============================================================================

/// Read the `cache` reply. The result replaces the previous cache as a whole.
pub fn extract_cache(payload: &Object, diagnostics: &mut Vec<Diagnostic>) -> CmakeCache {
    let entries = match array_field(payload, "cache") {
        Ok(entries) => entries,
        Err(message) => {
            record(diagnostics, "cache".to_string(), message);
            return CmakeCache::default();
        }
    };

    let mut cache = CmakeCache::default();
    for (index, entry) in entries.iter().enumerate() {
        match extract_cache_entry(entry) {
            Ok(entry) => cache.entries.push(entry),
            Err(message) => record(diagnostics, format!("cache entry #{index}"), message),
        }
    }
    cache
}

fn extract_cache_entry(value: &Value) -> Result<CacheEntry, String> {
    let entry = as_object(value, "cache entry")?;

    let properties = match entry.get("properties") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(properties)) => properties
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => Ok((key.clone(), s.clone())),
                other => Err(wrong_type(&format!("properties.{key}"), "a string", other)),
            })
            .collect::<Result<_, _>>()?,
        Some(other) => return Err(wrong_type("properties", "an object", other)),
    };

    Ok(CacheEntry {
        key: string_field(entry, "key")?,
        value: string_field(entry, "value")?,
        entry_type: CacheEntryType::from_wire(&string_field(entry, "type")?),
        properties,
    })
}

// ============================================================================
// CMake inputs
// ============================================================================

/// Read the `cmakeInputs` reply. Temporary files are dropped; the remaining
/// files are sorted and deduplicated by path.
pub fn extract_cmake_inputs(payload: &Object, diagnostics: &mut Vec<Diagnostic>) -> CmakeInputs {
    let mut inputs = CmakeInputs::default();

    match string_field(payload, "sourceDirectory") {
        Ok(dir) => inputs.source_directory = resolve_path(Path::new(""), &dir),
        Err(message) => record(diagnostics, "cmakeInputs".to_string(), message),
    }
    match string_field(payload, "cmakeRootDirectory") {
        Ok(dir) => inputs.cmake_root_directory = resolve_path(Path::new(""), &dir),
        Err(message) => record(diagnostics, "cmakeInputs".to_string(), message),
    }

    let build_files = match array_field(payload, "buildFiles") {
        Ok(build_files) => build_files,
        Err(message) => {
            record(diagnostics, "cmakeInputs".to_string(), message);
            return inputs;
        }
    };

    let mut files: BTreeMap<PathBuf, bool> = BTreeMap::new();
    for (index, set) in build_files.iter().enumerate() {
        if let Err(message) = extract_build_file_set(set, &inputs.source_directory, &mut files) {
            record(diagnostics, format!("build file set #{index}"), message);
        }
    }

    inputs.files = files
        .into_iter()
        .map(|(path, is_cmake)| CmakeInputFile { path, is_cmake })
        .collect();
    inputs
}

fn extract_build_file_set(value: &Value, base: &Path, files: &mut BTreeMap<PathBuf, bool>) -> Result<(), String> {
    let set = as_object(value, "buildFiles[]")?;
    let is_cmake = bool_field(set, "isCMake")?;
    let is_temporary = bool_field(set, "isTemporary")?;
    let sources = string_list_field(set, "sources")?;
    if is_temporary {
        return Ok(());
    }
    for source in sources {
        files.entry(resolve_path(base, &source)).or_insert(is_cmake);
    }
    Ok(())
}

/// `Project/target` label used in diagnostics and logs
pub fn target_path(model: &ProjectModel, target: TargetId) -> String {
    let target = model.target(target);
    format!("{}/{}", model.project(target.project).name, target.name)
}
