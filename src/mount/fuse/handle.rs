//! Open file handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A file opened through the union
pub struct OpenFile {
    /// Inode the handle was opened on
    pub ino: u64,
    /// Host file in the layer serving it
    pub file: File,
    /// Open flags
    pub flags: i32,
}

impl OpenFile {
    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }
}

/// Manages open file handles
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenFile>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle
    pub fn open(&self, ino: u64, file: File, flags: i32) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles
            .write()
            .insert(fh, Arc::new(OpenFile { ino, file, flags }));
        fh
    }

    /// Get handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close handle and return it
    pub fn close(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.write().remove(&fh)
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;

    #[test]
    fn test_open_get_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latest.log");
        std::fs::write(&path, b"[Server thread/INFO]: Done").unwrap();

        let table = HandleTable::new();
        let fh = table.open(7, File::open(&path).unwrap(), libc::O_RDONLY);
        let other = table.open(7, File::open(&path).unwrap(), libc::O_RDWR);
        assert_ne!(fh, other);
        assert_eq!(table.len(), 2);

        let handle = table.get(fh).unwrap();
        assert_eq!(handle.ino, 7);
        assert!(!handle.is_writable());
        assert!(table.get(other).unwrap().is_writable());

        let mut buf = [0u8; 4];
        handle.file.read_at(&mut buf, 22).unwrap();
        assert_eq!(&buf, b"Done");

        assert!(table.close(fh).is_some());
        assert!(table.close(fh).is_none());
        assert!(table.get(fh).is_none());
        assert_eq!(table.len(), 1);
    }
}
