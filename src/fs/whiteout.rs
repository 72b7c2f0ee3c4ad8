//! Whiteout codec
//!
//! A deleted name is recorded as a zero-length file `.wh.<name>` in the same
//! directory of a layer. A directory containing `.wh..wh..opq` is opaque:
//! layers below it contribute nothing beneath that directory. Names starting
//! with the prefix are reserved and never surface through the union.

use crate::error::{is_absent, Error, Result};
use crate::fs::path;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix reserved for whiteout markers
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker making a directory opaque
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Whether a file name is a marker of either kind
pub fn is_whiteout_name(name: &OsStr) -> bool {
    name.as_encoded_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
}

/// The name a whiteout marker masks, `None` for ordinary names and the opaque marker
pub fn masked_name(name: &OsStr) -> Option<OsString> {
    if name == OPAQUE_MARKER {
        return None;
    }
    let rest = strip_marker_prefix(name)?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_os_string())
}

#[cfg(unix)]
fn strip_marker_prefix(name: &OsStr) -> Option<&OsStr> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes()
        .strip_prefix(WHITEOUT_PREFIX.as_bytes())
        .map(OsStr::from_bytes)
}

#[cfg(not(unix))]
fn strip_marker_prefix(name: &OsStr) -> Option<&OsStr> {
    name.to_str()?.strip_prefix(WHITEOUT_PREFIX).map(OsStr::new)
}

/// Physical marker path for a logical path inside a layer
pub fn marker_path(root: &Path, logical: &Path) -> Option<PathBuf> {
    let name = logical.file_name()?;
    let dir = path::parent(logical)?;
    let mut marker = OsString::from(WHITEOUT_PREFIX);
    marker.push(name);
    Some(root.join(dir).join(marker))
}

/// Tombstone `logical` in the layer rooted at `root`
pub fn mark_deleted(root: &Path, logical: &Path) -> Result<()> {
    let marker = marker_path(root, logical).ok_or_else(|| Error::InvalidPath(logical.into()))?;
    if let Some(dir) = marker.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::at(logical, e))?;
    }
    fs::File::create(&marker).map_err(|e| Error::at(logical, e))?;
    tracing::debug!("whiteout {:?}", logical);
    Ok(())
}

/// Whether `logical` is tombstoned in this layer
pub fn is_deleted(root: &Path, logical: &Path) -> bool {
    marker_path(root, logical)
        .map(|m| fs::symlink_metadata(m).is_ok())
        .unwrap_or(false)
}

/// Remove a tombstone; reports whether one existed
pub fn unmark(root: &Path, logical: &Path) -> Result<bool> {
    let Some(marker) = marker_path(root, logical) else {
        return Ok(false);
    };
    match fs::remove_file(&marker) {
        Ok(()) => Ok(true),
        Err(e) if is_absent(&e) => Ok(false),
        Err(e) => Err(Error::at(logical, e)),
    }
}

/// Whether `logical` or any of its ancestors is tombstoned in this layer
pub fn is_masked(root: &Path, logical: &Path) -> bool {
    path::ancestors(logical)
        .into_iter()
        .skip(1)
        .chain(std::iter::once(logical))
        .any(|p| is_deleted(root, p))
}

/// Make a directory of this layer opaque
pub fn mark_opaque(root: &Path, dir: &Path) -> Result<()> {
    let marker = root.join(dir).join(OPAQUE_MARKER);
    fs::File::create(marker).map_err(|e| Error::at(dir, e))?;
    Ok(())
}

pub fn is_opaque(root: &Path, dir: &Path) -> bool {
    fs::symlink_metadata(root.join(dir).join(OPAQUE_MARKER)).is_ok()
}

/// Whether a proper ancestor directory of `logical` is opaque in this layer
pub fn has_opaque_ancestor(root: &Path, logical: &Path) -> bool {
    path::ancestors(logical)
        .into_iter()
        .any(|dir| is_opaque(root, dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mark_and_unmark() {
        let upper = tempdir().unwrap();
        let path = Path::new("world/level.dat");

        assert!(!is_deleted(upper.path(), path));
        mark_deleted(upper.path(), path).unwrap();

        let marker = upper.path().join("world/.wh.level.dat");
        assert!(marker.exists());
        assert_eq!(fs::metadata(&marker).unwrap().len(), 0);
        assert!(is_deleted(upper.path(), path));

        assert!(unmark(upper.path(), path).unwrap());
        assert!(!is_deleted(upper.path(), path));
        assert!(!unmark(upper.path(), path).unwrap());
    }

    #[test]
    fn test_masked_by_ancestor() {
        let upper = tempdir().unwrap();
        mark_deleted(upper.path(), Path::new("plugins")).unwrap();

        assert!(is_masked(upper.path(), Path::new("plugins")));
        assert!(is_masked(upper.path(), Path::new("plugins/a/b.jar")));
        assert!(!is_masked(upper.path(), Path::new("worlds")));
        assert!(!is_masked(upper.path(), Path::new("")));
    }

    #[test]
    fn test_name_codec() {
        assert!(is_whiteout_name(OsStr::new(".wh.foo")));
        assert!(is_whiteout_name(OsStr::new(OPAQUE_MARKER)));
        assert!(!is_whiteout_name(OsStr::new("foo.wh.")));

        assert_eq!(masked_name(OsStr::new(".wh.foo")), Some(OsString::from("foo")));
        assert_eq!(masked_name(OsStr::new(OPAQUE_MARKER)), None);
        assert_eq!(masked_name(OsStr::new("foo")), None);
        assert_eq!(masked_name(OsStr::new(".wh.")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_masked_name_non_utf8() {
        use std::os::unix::ffi::OsStrExt;

        let marker = OsStr::from_bytes(b".wh.world_\xff.dat");
        assert_eq!(
            masked_name(marker),
            Some(OsStr::from_bytes(b"world_\xff.dat").to_os_string())
        );
    }

    #[test]
    fn test_opaque() {
        let upper = tempdir().unwrap();
        fs::create_dir_all(upper.path().join("config")).unwrap();
        mark_opaque(upper.path(), Path::new("config")).unwrap();

        assert!(is_opaque(upper.path(), Path::new("config")));
        assert!(has_opaque_ancestor(upper.path(), Path::new("config/server.properties")));
        assert!(!has_opaque_ancestor(upper.path(), Path::new("config")));
    }

    #[test]
    fn test_root_has_no_marker() {
        let upper = tempdir().unwrap();
        assert!(marker_path(upper.path(), Path::new("")).is_none());
        assert!(mark_deleted(upper.path(), Path::new("")).is_err());
    }
}
