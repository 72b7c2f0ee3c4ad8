//! Copy-up engine
//!
//! Before anything mutates a path, the entry is duplicated from the layer it
//! resolves to into the upper layer. Copy-up is not transactional: an
//! interrupted copy leaves a partial entry in the upper layer.

use crate::error::{is_absent, Error, Result};
use crate::fs::layer::LayerStack;
use crate::fs::resolve::{Lookup, Resolver};
use crate::fs::{path, sys, whiteout};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-path locks serialising concurrent copy-ups of the same entry
#[derive(Default)]
pub struct CopyUpLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl CopyUpLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `path`
    pub fn with_lock<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(&*self.locks.entry(path.to_path_buf()).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of paths currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Copies entries from lower layers into the upper layer
pub struct CopyUp<'a> {
    layers: &'a LayerStack,
    locks: &'a CopyUpLocks,
}

impl<'a> CopyUp<'a> {
    pub fn new(layers: &'a LayerStack, locks: &'a CopyUpLocks) -> Self {
        CopyUp { layers, locks }
    }

    /// Make sure `path` physically exists in the upper layer
    ///
    /// No-op on a read-only union or when the entry is already in upper.
    pub fn ensure_upper(&self, path: &Path) -> Result<()> {
        let Some(upper) = self.layers.upper() else {
            return Ok(());
        };

        self.locks.with_lock(path, || {
            let lookup = Resolver::new(self.layers).resolve(path)?;
            if lookup.is_upper {
                return Ok(());
            }

            whiteout::unmark(upper.root(), path)?;
            self.ensure_parents(path)?;
            copy_entry(path, &lookup.physical(path), &upper.join(path), &lookup.metadata)?;

            info!("Copied up {:?} from {:?}", path, lookup.layer.root());
            Ok(())
        })
    }

    /// Duplicate an already resolved entry to `dest` in the upper layer
    pub fn duplicate(&self, path: &Path, lookup: &Lookup, dest: &Path) -> Result<()> {
        let upper = self
            .layers
            .upper()
            .ok_or_else(|| Error::PermissionDenied(dest.to_path_buf()))?;

        self.ensure_parents(dest)?;
        copy_entry(dest, &lookup.physical(path), &upper.join(dest), &lookup.metadata)?;
        debug!("Duplicated {:?} -> {:?}", path, dest);
        Ok(())
    }

    /// Create every missing ancestor directory of `path` in the upper layer
    ///
    /// New directories take the mode of the directory the union shows there.
    pub fn ensure_parents(&self, path: &Path) -> Result<()> {
        let upper = self
            .layers
            .upper()
            .ok_or_else(|| Error::PermissionDenied(path.to_path_buf()))?;
        let resolver = Resolver::new(self.layers);

        for dir in path::ancestors(path).into_iter().skip(1) {
            let physical = upper.join(dir);
            match fs::symlink_metadata(&physical) {
                Ok(m) if m.is_dir() => continue,
                Ok(_) => return Err(Error::NotADirectory(dir.to_path_buf())),
                Err(e) if is_absent(&e) => {}
                Err(e) => return Err(Error::at(dir, e)),
            }

            let lookup = resolver.resolve(dir)?;
            if !lookup.is_dir() {
                return Err(Error::NotADirectory(dir.to_path_buf()));
            }

            let mode = sys::mode_of(&lookup.metadata);
            match sys::create_dir(&physical, mode) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::at(dir, e)),
            }
            sys::set_mode(&physical, mode).map_err(|e| Error::at(dir, e))?;
            debug!("Created parent {:?} in upper", dir);
        }
        Ok(())
    }
}

/// Duplicate one entry of any supported type
fn copy_entry(logical: &Path, src: &Path, dst: &Path, metadata: &Metadata) -> Result<()> {
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(src).map_err(|e| Error::at(logical, e))?;
        sys::symlink(&target, dst).map_err(|e| Error::at(logical, e))
    } else if file_type.is_dir() {
        copy_tree(logical, src, dst, metadata)
    } else if file_type.is_file() {
        copy_file(src, dst, sys::mode_of(metadata)).map_err(|e| Error::at(logical, e))
    } else {
        Err(Error::InvalidType {
            path: logical.to_path_buf(),
            kind: sys::special_kind(metadata),
        })
    }
}

/// Stream a regular file's contents and mode
fn copy_file(src: &Path, dst: &Path, mode: u32) -> io::Result<()> {
    let mut reader = File::open(src)?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    sys::with_mode(&mut options, mode);
    let mut writer = options.open(dst)?;

    io::copy(&mut reader, &mut writer)?;
    sys::set_mode(dst, mode)
}

/// Recursively copy a directory subtree from a single layer
fn copy_tree(logical: &Path, src: &Path, dst: &Path, metadata: &Metadata) -> Result<()> {
    match sys::create_dir(dst, 0o700) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(Error::at(logical, e)),
    }

    for entry in fs::read_dir(src).map_err(|e| Error::at(logical, e))? {
        let entry = entry.map_err(|e| Error::at(logical, e))?;
        let name = entry.file_name();
        let child = logical.join(&name);
        let child_meta = entry.metadata().map_err(|e| Error::at(&child, e))?;
        copy_entry(&child, &src.join(&name), &dst.join(&name), &child_meta)?;
    }

    // Applied last so read-only directories can still be filled
    sys::set_mode(dst, sys::mode_of(metadata)).map_err(|e| Error::at(logical, e))
}
