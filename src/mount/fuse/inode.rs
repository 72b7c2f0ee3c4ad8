//! Inode table for the FUSE driver
//!
//! The kernel addresses entries by inode number while the union works on
//! logical paths. Numbers are handed out on first sight of a path and stay
//! stable across renames.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode number of the union root
pub const ROOT_INO: u64 = 1;

/// Map a host file type to the FUSE file type
pub fn file_kind(file_type: std::fs::FileType) -> fuser::FileType {
    use std::os::unix::fs::FileTypeExt;

    if file_type.is_dir() {
        fuser::FileType::Directory
    } else if file_type.is_symlink() {
        fuser::FileType::Symlink
    } else if file_type.is_block_device() {
        fuser::FileType::BlockDevice
    } else if file_type.is_char_device() {
        fuser::FileType::CharDevice
    } else if file_type.is_fifo() {
        fuser::FileType::NamedPipe
    } else if file_type.is_socket() {
        fuser::FileType::Socket
    } else {
        fuser::FileType::RegularFile
    }
}

/// Build FUSE attributes for `ino` from host metadata
pub fn to_attr(ino: u64, meta: &Metadata) -> fuser::FileAttr {
    use std::os::unix::fs::MetadataExt;

    let ctime = if meta.ctime() >= 0 {
        UNIX_EPOCH + Duration::new(meta.ctime() as u64, meta.ctime_nsec() as u32)
    } else {
        UNIX_EPOCH
    };

    fuser::FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime,
        crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
        kind: file_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

#[derive(Default)]
struct InodeMaps {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
}

impl InodeMaps {
    fn insert(&mut self, ino: u64, path: PathBuf) {
        self.by_path.insert(path.clone(), ino);
        self.by_ino.insert(ino, path);
    }
}

/// Bidirectional inode number <-> logical path table
pub struct InodeTable {
    /// Next inode number
    next_ino: AtomicU64,
    maps: RwLock<InodeMaps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = InodeMaps::default();
        maps.insert(ROOT_INO, PathBuf::new());

        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(maps),
        }
    }

    /// Logical path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.maps.read().by_ino.get(&ino).cloned()
    }

    /// Logical path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        Some(self.path(parent)?.join(name))
    }

    /// Inode number for a path, allocating one on first use
    pub fn get_or_alloc(&self, path: &Path) -> u64 {
        if let Some(ino) = self.maps.read().by_path.get(path) {
            return *ino;
        }

        let mut maps = self.maps.write();
        if let Some(ino) = maps.by_path.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        maps.insert(ino, path.to_path_buf());
        ino
    }

    /// Drop a path and everything below it
    pub fn forget(&self, path: &Path) {
        let mut maps = self.maps.write();
        let doomed: Vec<PathBuf> = maps
            .by_path
            .keys()
            .filter(|p| p.starts_with(path) && !p.as_os_str().is_empty())
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = maps.by_path.remove(&p) {
                maps.by_ino.remove(&ino);
            }
        }
    }

    /// Move a path and its descendants to a new name, keeping inode numbers
    pub fn rename(&self, old: &Path, new: &Path) {
        self.forget(new);

        let mut maps = self.maps.write();
        let moved: Vec<(PathBuf, u64)> = maps
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(old))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (path, ino) in moved {
            maps.by_path.remove(&path);
            let renamed = match path.strip_prefix(old) {
                Ok(rest) if rest.as_os_str().is_empty() => new.to_path_buf(),
                Ok(rest) => new.join(rest),
                Err(_) => continue,
            };
            maps.insert(ino, renamed);
        }
    }

    /// Number of known inodes, root included
    pub fn len(&self) -> usize {
        self.maps.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_root_and_alloc() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::new()));

        let world = table.get_or_alloc(Path::new("world"));
        assert_ne!(world, ROOT_INO);
        assert_eq!(table.get_or_alloc(Path::new("world")), world);
        assert_eq!(
            table.child_path(world, OsStr::new("level.dat")),
            Some(PathBuf::from("world/level.dat"))
        );
        assert_eq!(table.child_path(ROOT_INO, OsStr::new("eula.txt")), Some(PathBuf::from("eula.txt")));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_rename_rewrites_descendants() {
        let table = InodeTable::new();
        let world = table.get_or_alloc(Path::new("world"));
        let level = table.get_or_alloc(Path::new("world/level.dat"));
        let other = table.get_or_alloc(Path::new("world_nether"));
        let stale = table.get_or_alloc(Path::new("backup"));

        table.rename(Path::new("world"), Path::new("backup"));

        assert_eq!(table.path(world), Some(PathBuf::from("backup")));
        assert_eq!(table.path(level), Some(PathBuf::from("backup/level.dat")));
        assert_eq!(table.path(other), Some(PathBuf::from("world_nether")));
        assert_eq!(table.path(stale), None);
        assert_eq!(table.get_or_alloc(Path::new("backup")), world);
    }

    #[test]
    fn test_forget_subtree_keeps_root() {
        let table = InodeTable::new();
        let plugins = table.get_or_alloc(Path::new("plugins"));
        let jar = table.get_or_alloc(Path::new("plugins/a.jar"));

        table.forget(Path::new("plugins"));
        assert_eq!(table.path(plugins), None);
        assert_eq!(table.path(jar), None);

        table.forget(Path::new(""));
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::new()));
    }
}
