//! Path normalization
//!
//! Normalization is lexical: `.` components are dropped and `..` pops the
//! previous component. The file system is never consulted, so the same reply
//! always yields the same paths.

use std::path::{Component, Path, PathBuf};

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    normalized.pop();
                } else if !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() || base.as_os_str().is_empty() {
        normalize_path(path)
    } else {
        normalize_path(&base.join(path))
    }
}

/// Number of components `dir` shares with `path` when `dir` is a prefix of it
pub fn prefix_depth(dir: &Path, path: &Path) -> Option<usize> {
    if dir.as_os_str().is_empty() || !path.starts_with(dir) {
        return None;
    }
    Some(dir.components().count())
}
