//! Logical path handling
//!
//! The union addresses entries by a relative "logical" path. The empty path is
//! the union root.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Normalize a caller-supplied path into a logical path
///
/// Leading `/`, `.` components and trailing separators are dropped. `..` is
/// rejected rather than resolved so a path can never leave the union.
pub fn normalize(path: &Path) -> Result<PathBuf> {
    let mut logical = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => logical.push(name),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(path.to_path_buf()));
            }
        }
    }
    Ok(logical)
}

/// Whether a logical path names the union root
pub fn is_root(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

/// Logical parent of a path; the root has none
pub fn parent(path: &Path) -> Option<&Path> {
    if is_root(path) {
        None
    } else {
        Some(path.parent().unwrap_or(Path::new("")))
    }
}

/// Every proper ancestor of `path`, root first, excluding `path` itself
pub fn ancestors(path: &Path) -> Vec<&Path> {
    let mut out: Vec<&Path> = path.ancestors().skip(1).collect();
    out.reverse();
    out
}

/// Join a relative symlink target onto the logical directory holding the link
///
/// Returns `None` when the target is absolute or climbs above the union root.
pub fn join_lexical(dir: &Path, target: &Path) -> Option<PathBuf> {
    let mut joined = dir.to_path_buf();
    for component in target.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => joined.push(name),
            Component::ParentDir => {
                if !joined.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(joined)
}
