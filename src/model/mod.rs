//! Project model of one parse cycle
//!
//! Projects, targets and file groups live in a single arena ([`ProjectModel`])
//! and refer to each other through index handles. Owner links point down
//! (`Project::targets`, `Target::file_groups`), back links point up
//! (`Target::project`, `FileGroup::target`). Dropping the arena drops the
//! whole graph.

pub mod cache;
pub mod extract;
pub mod paths;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use cache::CmakeCache;

// ============================================================================
// Handles
// ============================================================================

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

arena_id!(ProjectId);
arena_id!(TargetId);
arena_id!(FileGroupId);

// ============================================================================
// Entities
// ============================================================================

/// Target type tag reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TargetType {
    Executable,
    StaticLibrary,
    SharedLibrary,
    ModuleLibrary,
    ObjectLibrary,
    InterfaceLibrary,
    Utility,
    Other(String),
}

impl TargetType {
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "EXECUTABLE" => TargetType::Executable,
            "STATIC_LIBRARY" => TargetType::StaticLibrary,
            "SHARED_LIBRARY" => TargetType::SharedLibrary,
            "MODULE_LIBRARY" => TargetType::ModuleLibrary,
            "OBJECT_LIBRARY" => TargetType::ObjectLibrary,
            "INTERFACE_LIBRARY" => TargetType::InterfaceLibrary,
            "UTILITY" => TargetType::Utility,
            _ => TargetType::Other(tag.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetType::Executable => "EXECUTABLE",
            TargetType::StaticLibrary => "STATIC_LIBRARY",
            TargetType::SharedLibrary => "SHARED_LIBRARY",
            TargetType::ModuleLibrary => "MODULE_LIBRARY",
            TargetType::ObjectLibrary => "OBJECT_LIBRARY",
            TargetType::InterfaceLibrary => "INTERFACE_LIBRARY",
            TargetType::Utility => "UTILITY",
            TargetType::Other(tag) => tag,
        }
    }

    pub fn is_library(&self) -> bool {
        matches!(
            self,
            TargetType::StaticLibrary
                | TargetType::SharedLibrary
                | TargetType::ModuleLibrary
                | TargetType::ObjectLibrary
                | TargetType::InterfaceLibrary
        )
    }
}

impl From<String> for TargetType {
    fn from(tag: String) -> Self {
        TargetType::from_wire(&tag)
    }
}

impl From<TargetType> for String {
    fn from(target_type: TargetType) -> Self {
        target_type.as_str().to_string()
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub name: String,
    pub source_directory: PathBuf,
    pub targets: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub project: ProjectId,
    pub name: String,
    pub full_name: String,
    pub target_type: TargetType,
    pub artifacts: Vec<PathBuf>,
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub linker_language: String,
    pub file_groups: Vec<FileGroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncludePath {
    pub path: PathBuf,
    /// System include directories suppress warnings downstream
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileGroup {
    pub target: TargetId,
    pub compile_flags: String,
    /// Kept exactly as reported; later duplicates override earlier ones when compiling
    pub defines: Vec<String>,
    pub include_paths: Vec<IncludePath>,
    /// Empty when the server reports no language
    pub language: String,
    pub sources: Vec<PathBuf>,
    pub is_generated: bool,
}

/// One file the configure step itself depends on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CmakeInputFile {
    pub path: PathBuf,
    /// Part of CMake's own module tree rather than the project
    pub is_cmake: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CmakeInputs {
    pub source_directory: PathBuf,
    pub cmake_root_directory: PathBuf,
    /// Sorted by path, no duplicates
    pub files: Vec<CmakeInputFile>,
}

/// A payload problem that cost one entity, not the whole cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub context: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Target fields supplied by the extractor; links are filled in by the arena
#[derive(Debug, Clone, Default)]
pub struct TargetInfo {
    pub name: String,
    pub full_name: String,
    pub target_type: String,
    pub artifacts: Vec<PathBuf>,
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub linker_language: String,
}

/// File group fields supplied by the extractor
#[derive(Debug, Clone, Default)]
pub struct FileGroupInfo {
    pub compile_flags: String,
    pub defines: Vec<String>,
    pub include_paths: Vec<IncludePath>,
    pub language: String,
    pub sources: Vec<PathBuf>,
    pub is_generated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectModel {
    projects: Vec<Project>,
    targets: Vec<Target>,
    file_groups: Vec<FileGroup>,
}

impl ProjectModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&mut self, name: String, source_directory: PathBuf) -> ProjectId {
        let id = ProjectId(self.projects.len());
        self.projects.push(Project {
            name,
            source_directory,
            targets: Vec::new(),
        });
        id
    }

    pub fn add_target(&mut self, project: ProjectId, info: TargetInfo) -> TargetId {
        let id = TargetId(self.targets.len());
        self.targets.push(Target {
            project,
            name: info.name,
            full_name: info.full_name,
            target_type: TargetType::from_wire(&info.target_type),
            artifacts: info.artifacts,
            source_directory: info.source_directory,
            build_directory: info.build_directory,
            linker_language: info.linker_language,
            file_groups: Vec::new(),
        });
        self.projects[project.0].targets.push(id);
        id
    }

    pub fn add_file_group(&mut self, target: TargetId, info: FileGroupInfo) -> FileGroupId {
        let id = FileGroupId(self.file_groups.len());
        self.file_groups.push(FileGroup {
            target,
            compile_flags: info.compile_flags,
            defines: info.defines,
            include_paths: info.include_paths,
            language: info.language,
            sources: info.sources,
            is_generated: info.is_generated,
        });
        self.targets[target.0].file_groups.push(id);
        id
    }

    pub fn project(&self, id: ProjectId) -> &Project {
        &self.projects[id.0]
    }

    pub fn target(&self, id: TargetId) -> &Target {
        &self.targets[id.0]
    }

    pub fn file_group(&self, id: FileGroupId) -> &FileGroup {
        &self.file_groups[id.0]
    }

    pub fn projects(&self) -> impl Iterator<Item = (ProjectId, &Project)> {
        self.projects
            .iter()
            .enumerate()
            .map(|(index, project)| (ProjectId(index), project))
    }

    /// All targets, in project order then reported order
    pub fn targets(&self) -> impl Iterator<Item = (TargetId, &Target)> {
        self.projects
            .iter()
            .flat_map(|project| project.targets.iter())
            .map(|&id| (id, &self.targets[id.0]))
    }

    pub fn file_groups_of(&self, target: TargetId) -> impl Iterator<Item = &FileGroup> {
        self.targets[target.0]
            .file_groups
            .iter()
            .map(|&id| &self.file_groups[id.0])
    }

    pub fn project_by_name(&self, name: &str) -> Option<ProjectId> {
        self.projects
            .iter()
            .position(|project| project.name == name)
            .map(ProjectId)
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn file_group_count(&self) -> usize {
        self.file_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Everything one successful parse cycle produced. Published as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub model: ProjectModel,
    pub cache: CmakeCache,
    pub inputs: CmakeInputs,
    pub diagnostics: Vec<Diagnostic>,
}
