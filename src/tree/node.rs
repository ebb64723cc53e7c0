//! Project tree nodes
//!
//! The tree is an arena of slots. A [`NodeId`] stays valid for as long as its
//! node survives reconciliation and is never handed out again after removal.

use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileKind {
    Source,
    Header,
    Cmake,
    Other,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        if path.file_name().is_some_and(|name| name == "CMakeLists.txt") {
            return FileKind::Cmake;
        }
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return FileKind::Other;
        };
        match extension.to_ascii_lowercase().as_str() {
            "h" | "hh" | "hpp" | "hxx" | "h++" | "inl" | "ipp" | "tcc" => FileKind::Header,
            "c" | "cc" | "cpp" | "cxx" | "c++" | "m" | "mm" | "cu" => FileKind::Source,
            "cmake" => FileKind::Cmake,
            _ => FileKind::Other,
        }
    }
}

/// A file found on disk, offered to the reconciler for header attribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

impl KnownFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = FileKind::from_path(&path);
        Self { path, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Root,
    /// The listfiles that make up the build system
    BuildFiles,
    Project {
        name: String,
        source_directory: PathBuf,
    },
    Target {
        name: String,
        source_directory: PathBuf,
        target_type: String,
    },
    Folder {
        path: PathBuf,
    },
    VirtualFolder {
        path: PathBuf,
        label: String,
    },
    File {
        path: PathBuf,
        kind: FileKind,
        /// Listed only by generated file groups or part of CMake itself
        is_generated: bool,
    },
}

/// Identity of a node among its siblings
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKey {
    Root,
    BuildFiles,
    Project(PathBuf, String),
    Target(PathBuf, String),
    Folder(PathBuf),
    VirtualFolder(PathBuf),
    File(PathBuf),
}

impl NodeKind {
    pub fn key(&self) -> NodeKey {
        match self {
            NodeKind::Root => NodeKey::Root,
            NodeKind::BuildFiles => NodeKey::BuildFiles,
            NodeKind::Project {
                name,
                source_directory,
            } => NodeKey::Project(source_directory.clone(), name.clone()),
            NodeKind::Target {
                name,
                source_directory,
                ..
            } => NodeKey::Target(source_directory.clone(), name.clone()),
            NodeKind::Folder { path } => NodeKey::Folder(path.clone()),
            NodeKind::VirtualFolder { path, .. } => NodeKey::VirtualFolder(path.clone()),
            NodeKind::File { path, .. } => NodeKey::File(path.clone()),
        }
    }

    pub fn display_name(&self) -> String {
        fn last_component(path: &Path) -> String {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        }

        match self {
            NodeKind::Root => String::new(),
            NodeKind::BuildFiles => "CMake Modules".to_string(),
            NodeKind::Project { name, .. } | NodeKind::Target { name, .. } => name.clone(),
            NodeKind::Folder { path } => last_component(path),
            NodeKind::VirtualFolder { label, .. } => label.clone(),
            NodeKind::File { path, .. } => last_component(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Arena of nodes addressed by [`NodeId`]
///
/// Removed nodes leave an empty slot behind and ids are never reused, so a
/// stale id held by a caller can only miss. The slot vector therefore grows
/// by one entry per node ever created; a caller that churns a tree for a long
/// time can start over with a fresh tree, which hands out new ids.
#[derive(Debug, Clone)]
pub struct ProjectTree {
    slots: Vec<Option<Node>>,
    root: NodeId,
}

impl Default for ProjectTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectTree {
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Node {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
            })],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.children(self.root).is_empty()
    }

    /// Follow a chain of display names from the root
    pub fn find_path(&self, names: &[&str]) -> Option<NodeId> {
        names.iter().try_fold(self.root, |current, name| {
            self.children(current).iter().copied().find(|&child| {
                self.node(child)
                    .is_some_and(|node| node.kind.display_name() == *name)
            })
        })
    }

    /// All file paths below `id`, in tree order
    pub fn files_under(&self, id: NodeId) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            if let NodeKind::File { path, .. } = &node.kind {
                files.push(path.clone());
            }
            stack.extend(node.children.iter().rev());
        }
        files
    }

    pub(crate) fn insert(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.slots.len());
        self.slots.push(Some(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        }));
        id
    }

    pub(crate) fn set_kind(&mut self, id: NodeId, kind: NodeKind) {
        if let Some(node) = self.slots.get_mut(id.0).and_then(Option::as_mut) {
            node.kind = kind;
        }
    }

    pub(crate) fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        if let Some(node) = self.slots.get_mut(id.0).and_then(Option::as_mut) {
            node.children = children;
        }
    }

    /// Remove a subtree, children before parents. Returns the removed ids.
    pub(crate) fn remove_subtree(&mut self, id: NodeId, removed: &mut Vec<NodeId>) {
        let children = self.children(id).to_vec();
        for child in children {
            self.remove_subtree(child, removed);
        }
        if let Some(slot) = self.slots.get_mut(id.0)
            && slot.take().is_some()
        {
            removed.push(id);
        }
    }

    /// Indented text rendering, one node per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(self.root, 0, &mut out);
        out
    }

    fn render_into(&self, id: NodeId, depth: usize, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        if depth > 0 {
            let marker = match node.kind {
                NodeKind::File {
                    is_generated: true, ..
                } => " (generated)",
                _ => "",
            };
            let _ = writeln!(
                out,
                "{}{}{}",
                "  ".repeat(depth - 1),
                node.kind.display_name(),
                marker
            );
        }
        for &child in &node.children {
            self.render_into(child, depth + 1, out);
        }
    }
}
