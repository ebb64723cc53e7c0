//! Tree reconciliation
//!
//! [`reconcile`] computes the layout a snapshot calls for and merges it into
//! an existing [`ProjectTree`]. Nodes whose identity key matches a sibling
//! from the previous pass keep their [`NodeId`] and get their attributes
//! refreshed; the rest are created. Old nodes without a counterpart are
//! removed, deepest first.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::node::{FileKind, KnownFile, NodeId, NodeKind, ProjectTree};
use crate::model::paths::prefix_depth;
use crate::model::{Snapshot, TargetId};

pub const BUILD_DIRECTORY_LABEL: &str = "<Build Directory>";
pub const OTHER_LOCATIONS_LABEL: &str = "<Other Locations>";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kept: Vec<NodeId>,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl ReconcileReport {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ============================================================================
// Desired layout
// ============================================================================

#[derive(Debug)]
struct Desired {
    kind: NodeKind,
    children: Vec<Desired>,
}

impl Desired {
    fn leaf(kind: NodeKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }
}

/// Files of one subtree, nested by directory
#[derive(Debug, Default)]
struct FolderBuilder {
    folders: BTreeMap<OsString, FolderBuilder>,
    /// path -> generated; a file is generated only if every listing says so
    files: BTreeMap<PathBuf, bool>,
}

impl FolderBuilder {
    fn add(&mut self, relative: &Path, path: &Path, is_generated: bool) {
        let mut folder = self;
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                folder = folder
                    .folders
                    .entry(component.as_os_str().to_os_string())
                    .or_default();
            }
        }
        folder
            .files
            .entry(path.to_path_buf())
            .and_modify(|generated| *generated &= is_generated)
            .or_insert(is_generated);
    }

    fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    fn into_nodes(self, base: &Path) -> Vec<Desired> {
        let mut nodes: Vec<Desired> = self
            .folders
            .into_iter()
            .map(|(name, folder)| {
                let path = base.join(&name);
                Desired {
                    children: folder.into_nodes(&path),
                    kind: NodeKind::Folder { path },
                }
            })
            .collect();
        nodes.extend(self.files.into_iter().map(|(path, is_generated)| {
            Desired::leaf(NodeKind::File {
                kind: FileKind::from_path(&path),
                path,
                is_generated,
            })
        }));
        nodes
    }
}

/// Place files relative to the source directory, the build directory or
/// neither. The build directory is checked first since it often lives
/// inside the source tree.
#[derive(Debug, Default)]
struct FileLayout {
    source: FolderBuilder,
    build: FolderBuilder,
    other: BTreeMap<PathBuf, bool>,
}

impl FileLayout {
    fn add(&mut self, source_directory: &Path, build_directory: &Path, path: &Path, is_generated: bool) {
        if prefix_depth(build_directory, path).is_some() && build_directory != source_directory {
            if let Ok(relative) = path.strip_prefix(build_directory) {
                self.build.add(relative, path, is_generated);
                return;
            }
        }
        if prefix_depth(source_directory, path).is_some() {
            if let Ok(relative) = path.strip_prefix(source_directory) {
                self.source.add(relative, path, is_generated);
                return;
            }
        }
        self.other
            .entry(path.to_path_buf())
            .and_modify(|generated| *generated &= is_generated)
            .or_insert(is_generated);
    }

    fn into_nodes(self, source_directory: &Path, build_directory: &Path) -> Vec<Desired> {
        let mut nodes = self.source.into_nodes(source_directory);
        if !self.build.is_empty() {
            nodes.push(Desired {
                children: self.build.into_nodes(build_directory),
                kind: NodeKind::VirtualFolder {
                    path: build_directory.to_path_buf(),
                    label: BUILD_DIRECTORY_LABEL.to_string(),
                },
            });
        }
        if !self.other.is_empty() {
            nodes.push(Desired {
                children: self
                    .other
                    .into_iter()
                    .map(|(path, is_generated)| {
                        Desired::leaf(NodeKind::File {
                            kind: FileKind::from_path(&path),
                            path,
                            is_generated,
                        })
                    })
                    .collect(),
                kind: NodeKind::VirtualFolder {
                    path: PathBuf::from(OTHER_LOCATIONS_LABEL),
                    label: OTHER_LOCATIONS_LABEL.to_string(),
                },
            });
        }
        nodes
    }
}

/// Target owning a header: longest source directory prefix, first in model
/// order on equal prefixes
fn header_owner(snapshot: &Snapshot, header: &Path) -> Option<TargetId> {
    let mut best: Option<(usize, TargetId)> = None;
    for (id, target) in snapshot.model.targets() {
        let Some(depth) = prefix_depth(&target.source_directory, header) else {
            continue;
        };
        if best.is_none_or(|(best_depth, _)| depth > best_depth) {
            best = Some((depth, id));
        }
    }
    best.map(|(_, id)| id)
}

fn build_files_node(snapshot: &Snapshot) -> Option<Desired> {
    let inputs = &snapshot.inputs;
    if inputs.files.is_empty() {
        return None;
    }

    let mut layout = FileLayout::default();
    for file in &inputs.files {
        let inside_cmake_root = prefix_depth(&inputs.cmake_root_directory, &file.path).is_some();
        // Without a build directory of its own the build files only split into source and other
        layout.add(
            &inputs.source_directory,
            Path::new(""),
            &file.path,
            file.is_cmake || inside_cmake_root,
        );
    }

    Some(Desired {
        kind: NodeKind::BuildFiles,
        children: layout.into_nodes(&inputs.source_directory, Path::new("")),
    })
}

fn desired_layout(snapshot: &Snapshot, all_files: &[KnownFile]) -> Vec<Desired> {
    let model = &snapshot.model;

    // Files some non-generated file group claims
    let owned: HashSet<&Path> = model
        .targets()
        .flat_map(|(id, _)| model.file_groups_of(id))
        .filter(|group| !group.is_generated)
        .flat_map(|group| group.sources.iter().map(PathBuf::as_path))
        .collect();

    let mut extra_headers: BTreeMap<TargetId, Vec<&Path>> = BTreeMap::new();
    for file in all_files.iter().filter(|file| file.kind == FileKind::Header) {
        if owned.contains(file.path.as_path()) {
            continue;
        }
        if let Some(owner) = header_owner(snapshot, &file.path) {
            extra_headers.entry(owner).or_default().push(&file.path);
        }
    }

    let mut nodes = Vec::new();
    nodes.extend(build_files_node(snapshot));

    for (_, project) in model.projects() {
        let targets = project
            .targets
            .iter()
            .map(|&target_id| {
                let target = model.target(target_id);
                let mut layout = FileLayout::default();
                for group in model.file_groups_of(target_id) {
                    for source in &group.sources {
                        layout.add(
                            &target.source_directory,
                            &target.build_directory,
                            source,
                            group.is_generated,
                        );
                    }
                }
                for header in extra_headers.get(&target_id).into_iter().flatten() {
                    layout.add(&target.source_directory, &target.build_directory, header, false);
                }

                Desired {
                    children: layout.into_nodes(&target.source_directory, &target.build_directory),
                    kind: NodeKind::Target {
                        name: target.name.clone(),
                        source_directory: target.source_directory.clone(),
                        target_type: target.target_type.to_string(),
                    },
                }
            })
            .collect();

        nodes.push(Desired {
            kind: NodeKind::Project {
                name: project.name.clone(),
                source_directory: project.source_directory.clone(),
            },
            children: targets,
        });
    }

    nodes
}

// ============================================================================
// Merge
// ============================================================================

fn merge_children(tree: &mut ProjectTree, parent: NodeId, desired: Vec<Desired>, report: &mut ReconcileReport) {
    let mut existing: Vec<NodeId> = tree.children(parent).to_vec();
    let mut children = Vec::with_capacity(desired.len());

    for wanted in desired {
        let key = wanted.kind.key();
        let matched = existing
            .iter()
            .position(|&id| tree.node(id).is_some_and(|node| node.kind.key() == key))
            .map(|index| existing.remove(index));

        let id = match matched {
            Some(id) => {
                tree.set_kind(id, wanted.kind);
                report.kept.push(id);
                id
            }
            None => {
                let id = tree.insert(parent, wanted.kind);
                report.added.push(id);
                id
            }
        };
        merge_children(tree, id, wanted.children, report);
        children.push(id);
    }

    for stale in existing {
        tree.remove_subtree(stale, &mut report.removed);
    }
    tree.set_children(parent, children);
}

/// Bring `tree` in line with `snapshot`. `all_files` are the files known on
/// disk; headers among them are attached to the target that owns their directory.
pub fn reconcile(tree: &mut ProjectTree, snapshot: &Snapshot, all_files: &[KnownFile]) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let root = tree.root();
    merge_children(tree, root, desired_layout(snapshot, all_files), &mut report);

    debug!(
        "Tree reconciled: {} kept, {} added, {} removed",
        report.kept.len(),
        report.added.len(),
        report.removed.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CmakeInputFile, FileGroupInfo, ProjectModel, TargetInfo};

    fn target(name: &str, source: &str) -> TargetInfo {
        TargetInfo {
            name: name.to_string(),
            target_type: "EXECUTABLE".to_string(),
            source_directory: PathBuf::from(source),
            build_directory: PathBuf::from("/p/build"),
            ..Default::default()
        }
    }

    fn group(sources: &[&str], is_generated: bool) -> FileGroupInfo {
        FileGroupInfo {
            language: "CXX".to_string(),
            sources: sources.iter().map(PathBuf::from).collect(),
            is_generated,
            ..Default::default()
        }
    }

    fn two_target_snapshot() -> Snapshot {
        let mut model = ProjectModel::new();
        let project = model.add_project("P".to_string(), PathBuf::from("/p"));
        let a = model.add_target(project, target("a", "/p/src"));
        model.add_file_group(a, group(&["/p/src/main.cpp", "/p/build/gen.cpp"], false));
        let b = model.add_target(project, target("b", "/p/src/sub"));
        model.add_file_group(b, group(&["/p/src/sub/lib.cpp"], false));

        let mut snapshot = Snapshot {
            model,
            ..Default::default()
        };
        snapshot.inputs.source_directory = PathBuf::from("/p");
        snapshot.inputs.cmake_root_directory = PathBuf::from("/usr/share/cmake");
        snapshot.inputs.files = vec![
            CmakeInputFile {
                path: PathBuf::from("/p/CMakeLists.txt"),
                is_cmake: false,
            },
            CmakeInputFile {
                path: PathBuf::from("/usr/share/cmake/Modules/CMakeCXXInformation.cmake"),
                is_cmake: true,
            },
        ];
        snapshot
    }

    fn known(paths: &[&str]) -> Vec<KnownFile> {
        paths.iter().map(|p| KnownFile::new(*p)).collect()
    }

    #[test]
    fn test_layout_groups_build_and_other_locations() {
        let mut tree = ProjectTree::new();
        reconcile(&mut tree, &two_target_snapshot(), &[]);

        assert!(tree.find_path(&["P", "a", "main.cpp"]).is_some());
        assert!(tree.find_path(&["P", "a", "sub"]).is_none(), "sub/ belongs to b only");
        assert!(
            tree.find_path(&["P", "a", BUILD_DIRECTORY_LABEL, "gen.cpp"]).is_some(),
            "{}",
            tree.render()
        );
        assert!(tree.find_path(&["CMake Modules", "CMakeLists.txt"]).is_some());

        let cmake_module = tree
            .find_path(&["CMake Modules", OTHER_LOCATIONS_LABEL, "CMakeCXXInformation.cmake"])
            .unwrap();
        assert!(matches!(
            tree.node(cmake_module).unwrap().kind,
            NodeKind::File {
                is_generated: true,
                ..
            }
        ));
    }

    #[test]
    fn test_header_longest_prefix_wins() {
        let mut tree = ProjectTree::new();
        reconcile(
            &mut tree,
            &two_target_snapshot(),
            &known(&["/p/src/sub/h.h", "/p/src/h.h", "/elsewhere/x.h", "/p/src/notes.txt"]),
        );

        assert!(tree.find_path(&["P", "b", "h.h"]).is_some(), "{}", tree.render());
        assert!(tree.find_path(&["P", "a", "h.h"]).is_some());
        assert!(tree.find_path(&["P", "a", "sub"]).is_none());
        assert!(!tree.render().contains("x.h"));
        assert!(!tree.render().contains("notes.txt"));
    }

    #[test]
    fn test_equal_prefix_goes_to_first_target() {
        let mut model = ProjectModel::new();
        let project = model.add_project("P".to_string(), PathBuf::from("/p"));
        model.add_target(project, target("first", "/p"));
        model.add_target(project, target("second", "/p"));
        let snapshot = Snapshot {
            model,
            ..Default::default()
        };

        let mut tree = ProjectTree::new();
        reconcile(&mut tree, &snapshot, &known(&["/p/shared.h"]));
        assert!(tree.find_path(&["P", "first", "shared.h"]).is_some());
        assert!(tree.find_path(&["P", "second", "shared.h"]).is_none());
    }

    #[test]
    fn test_generated_listing_does_not_claim_header() {
        let mut model = ProjectModel::new();
        let project = model.add_project("P".to_string(), PathBuf::from("/p"));
        let t = model.add_target(project, target("t", "/p"));
        model.add_file_group(t, group(&["/p/config.h"], true));
        let snapshot = Snapshot {
            model,
            ..Default::default()
        };

        let mut tree = ProjectTree::new();
        reconcile(&mut tree, &snapshot, &known(&["/p/config.h"]));
        let node = tree.find_path(&["P", "t", "config.h"]).unwrap();
        assert!(matches!(
            tree.node(node).unwrap().kind,
            NodeKind::File {
                is_generated: false,
                ..
            }
        ));
    }

    #[test]
    fn test_reconcile_is_idempotent_and_keeps_ids() {
        let snapshot = two_target_snapshot();
        let files = known(&["/p/src/h.h"]);
        let mut tree = ProjectTree::new();

        let first = reconcile(&mut tree, &snapshot, &files);
        assert!(first.kept.is_empty());
        let main = tree.find_path(&["P", "a", "main.cpp"]).unwrap();
        let rendered = tree.render();

        let second = reconcile(&mut tree, &snapshot, &files);
        assert!(second.is_unchanged());
        assert_eq!(second.kept.len(), first.added.len());
        assert_eq!(tree.find_path(&["P", "a", "main.cpp"]), Some(main));
        assert_eq!(tree.render(), rendered);
    }

    #[test]
    fn test_removed_nodes_reported_and_survivors_kept() {
        let mut tree = ProjectTree::new();
        reconcile(&mut tree, &two_target_snapshot(), &[]);
        let a = tree.find_path(&["P", "a"]).unwrap();
        let lib = tree.find_path(&["P", "b", "lib.cpp"]).unwrap();
        let b = tree.find_path(&["P", "b"]).unwrap();

        let mut model = ProjectModel::new();
        let project = model.add_project("P".to_string(), PathBuf::from("/p"));
        let only_a = model.add_target(project, target("a", "/p/src"));
        model.add_file_group(only_a, group(&["/p/src/main.cpp"], false));
        let smaller = Snapshot {
            model,
            ..Default::default()
        };

        let report = reconcile(&mut tree, &smaller, &[]);
        assert_eq!(tree.find_path(&["P", "a"]), Some(a));
        assert!(report.removed.contains(&lib));
        assert!(report.removed.contains(&b));
        let lib_position = report.removed.iter().position(|&id| id == lib);
        let b_position = report.removed.iter().position(|&id| id == b);
        assert!(lib_position < b_position);
        assert!(!tree.contains(b));
        assert!(tree.find_path(&["CMake Modules"]).is_none());
    }
}
