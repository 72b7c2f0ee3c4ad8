//! Union operation dispatcher
//!
//! [`UnionFs`] exposes POSIX-like operations over a [`LayerStack`]. Reads are
//! served from whichever layer a path resolves to; every mutation lands in the
//! upper layer, copying entries up first and recording deletions as whiteouts.

use crate::config::OverlayConfig;
use crate::error::{Error, Result};
use crate::fs::copyup::{CopyUp, CopyUpLocks};
use crate::fs::layer::{Layer, LayerStack};
use crate::fs::merge::{DirEntry, MergeView};
use crate::fs::resolve::{Lookup, Resolver};
use crate::fs::{path, sys, whiteout};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Symlink hops followed before giving up
const MAX_SYMLINK_HOPS: usize = 40;

/// Default mode for files created through the union
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default mode for directories created through the union
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Options for [`UnionFs::open_with`], mirroring `std::fs::OpenOptions`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
    mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions {
            read: false,
            write: false,
            append: false,
            create: false,
            create_new: false,
            truncate: false,
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Permission bits for newly created files
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Build options from `open(2)` flags
    #[cfg(unix)]
    pub fn from_flags(flags: i32) -> Self {
        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        options
            .append(flags & libc::O_APPEND != 0)
            .truncate(flags & libc::O_TRUNC != 0);
        if flags & libc::O_CREAT != 0 {
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        options
    }

    /// Whether opening with these options changes the union
    pub fn is_mutating(&self) -> bool {
        self.write || self.append || self.create || self.create_new || self.truncate
    }

    fn to_std(self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .create_new(self.create_new)
            .truncate(self.truncate);
        sys::with_mode(&mut options, self.mode);
        options
    }
}

/// Where a chain of symlinks ends up
enum Target {
    /// An entry inside the union, with its logical path
    Union(PathBuf, Lookup),
    /// A path on the host outside every layer
    Host(PathBuf),
    /// An absent union path a dangling link points at
    Missing(PathBuf),
}

/// A copy-on-write union over one layer stack
pub struct UnionFs {
    layers: LayerStack,
    locks: CopyUpLocks,
}

impl UnionFs {
    pub fn new(layers: LayerStack) -> Self {
        UnionFs {
            layers,
            locks: CopyUpLocks::new(),
        }
    }

    /// Open a union from configuration
    ///
    /// The upper directory is created if missing; every lower layer must exist.
    pub fn from_config(config: &OverlayConfig) -> Result<Self> {
        let layers = LayerStack::from_config(config);
        if layers.is_empty() {
            return Err(Error::InvalidConfig("no layers configured".into()));
        }
        if let Some(upper) = layers.upper() {
            fs::create_dir_all(upper.root()).map_err(|e| Error::at(upper.root(), e))?;
        }
        layers.check_lower()?;

        info!(
            "Opened union with {} lower layer(s), {}",
            layers.lower().len(),
            if layers.is_read_only() { "read-only" } else { "writable" }
        );
        Ok(Self::new(layers))
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    pub fn is_read_only(&self) -> bool {
        self.layers.is_read_only()
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.layers)
    }

    fn copy_up(&self) -> CopyUp<'_> {
        CopyUp::new(&self.layers, &self.locks)
    }

    /// The upper layer, or PermissionDenied on a read-only union
    fn writable(&self, path: &Path) -> Result<&Layer> {
        self.layers
            .upper()
            .ok_or_else(|| Error::PermissionDenied(path.to_path_buf()))
    }

    /// Resolve `dir` and require a directory
    fn require_dir(&self, dir: &Path) -> Result<Lookup> {
        let lookup = self.resolver().resolve(dir)?;
        if !lookup.is_dir() {
            return Err(Error::NotADirectory(dir.to_path_buf()));
        }
        Ok(lookup)
    }

    /// Resolve `path`, treating NotFound as `None`
    fn try_resolve(&self, path: &Path) -> Result<Option<Lookup>> {
        match self.resolver().resolve(path) {
            Ok(lookup) => Ok(Some(lookup)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Follow symlinks from `path`, resolving relative targets inside the union
    fn follow(&self, path: &Path) -> Result<Target> {
        self.chase(path, false)
    }

    /// Like [`Self::follow`]; with `dangling`, a missing in-union target ends
    /// the chain as [`Target::Missing`] instead of failing
    fn chase(&self, path: &Path, dangling: bool) -> Result<Target> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_HOPS {
            let lookup = match self.resolver().resolve(&current) {
                Ok(lookup) => lookup,
                Err(e) if e.is_not_found() && dangling && current.as_path() != path => {
                    return Ok(Target::Missing(current));
                }
                Err(e) if e.is_not_found() => return Err(Error::NotFound(path.to_path_buf())),
                Err(e) => return Err(e),
            };
            if !lookup.is_symlink() {
                return Ok(Target::Union(current, lookup));
            }

            let physical = lookup.physical(&current);
            let link = fs::read_link(&physical).map_err(|e| Error::at(path, e))?;
            if link.is_absolute() {
                return Ok(Target::Host(link));
            }

            let dir = path::parent(&current).unwrap_or(Path::new(""));
            match path::join_lexical(dir, &link) {
                Some(next) => current = next,
                // Climbs out of the union: resolve on the host like the OS would
                None => {
                    let base = physical.parent().unwrap_or(lookup.layer.root());
                    return Ok(Target::Host(base.join(link)));
                }
            }
        }
        Err(Error::PathIo {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "too many levels of symbolic links"),
        })
    }

    /// Follow symlinks for a mutation; targets outside the union are refused
    fn follow_for_write(&self, path: &Path) -> Result<PathBuf> {
        match self.follow(path)? {
            Target::Union(resolved, _) => Ok(resolved),
            Target::Host(_) => Err(Error::PermissionDenied(path.to_path_buf())),
            Target::Missing(_) => Err(Error::NotFound(path.to_path_buf())),
        }
    }

    /// Resolve a path to the layer providing it
    pub fn lookup(&self, path: impl AsRef<Path>) -> Result<Lookup> {
        let path = path::normalize(path.as_ref())?;
        self.resolver().resolve(&path)
    }

    /// Metadata of the entry itself; symlinks are not followed
    pub fn lstat(&self, path: impl AsRef<Path>) -> Result<Metadata> {
        Ok(self.lookup(path)?.metadata)
    }

    /// Metadata with symlinks followed
    pub fn stat(&self, path: impl AsRef<Path>) -> Result<Metadata> {
        let path = path::normalize(path.as_ref())?;
        match self.follow(&path)? {
            Target::Union(_, lookup) => Ok(lookup.metadata),
            Target::Host(host) => fs::metadata(&host).map_err(|e| Error::at(&path, e)),
            Target::Missing(_) => Err(Error::NotFound(path)),
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.lookup(path).is_ok()
    }

    pub fn read_link(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path::normalize(path.as_ref())?;
        let lookup = self.resolver().resolve(&path)?;
        fs::read_link(lookup.physical(&path)).map_err(|e| Error::at(&path, e))
    }

    /// Open a file for reading from the layer it resolves to
    pub fn open(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path::normalize(path.as_ref())?;
        debug!("open {:?}", path);
        let physical = match self.follow(&path)? {
            Target::Union(resolved, lookup) => lookup.physical(&resolved),
            Target::Host(host) => host,
            Target::Missing(_) => return Err(Error::NotFound(path)),
        };
        File::open(physical).map_err(|e| Error::at(&path, e))
    }

    /// Open a file with explicit options
    ///
    /// Mutating opens copy the file up first and always operate on the upper
    /// layer. With `create`, a tombstoned name starts out empty.
    pub fn open_with(&self, path: impl AsRef<Path>, options: &OpenOptions) -> Result<File> {
        let path = path::normalize(path.as_ref())?;
        if !options.is_mutating() {
            return self.open(&path);
        }

        let upper = self.writable(&path)?;
        debug!("open_with {:?} {:?}", path, options);

        let target = match self.try_resolve(&path)? {
            Some(_) if options.create_new => return Err(Error::AlreadyExists(path)),
            Some(lookup) if lookup.is_dir() => return Err(Error::IsADirectory(path)),
            Some(lookup) if lookup.is_symlink() => match self.chase(&path, options.create)? {
                Target::Union(_, resolved) if resolved.is_dir() => {
                    return Err(Error::IsADirectory(path))
                }
                Target::Union(target, _) => {
                    self.copy_up().ensure_upper(&target)?;
                    target
                }
                // Dangling link: create the file it names, like open(2)
                Target::Missing(target) => {
                    self.prepare_create(upper, &target)?;
                    target
                }
                Target::Host(_) => return Err(Error::PermissionDenied(path)),
            },
            Some(_) => {
                self.copy_up().ensure_upper(&path)?;
                path.clone()
            }
            None if options.create || options.create_new => {
                self.prepare_create(upper, &path)?;
                path.clone()
            }
            None => return Err(Error::NotFound(path)),
        };

        options
            .to_std()
            .open(upper.join(&target))
            .map_err(|e| Error::at(&path, e))
    }

    /// Make room for a new file at `path` in the upper layer
    fn prepare_create(&self, upper: &Layer, path: &Path) -> Result<()> {
        check_name(path)?;
        let parent = path::parent(path).ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
        self.require_dir(parent)?;
        if whiteout::unmark(upper.root(), path)? {
            debug!("Cleared whiteout for {:?}", path);
        }
        self.copy_up().ensure_parents(path)
    }

    /// Create or truncate a file for writing
    pub fn create(&self, path: impl AsRef<Path>) -> Result<File> {
        self.open_with(
            path,
            OpenOptions::new().write(true).create(true).truncate(true),
        )
    }

    /// Merged listing of a directory
    pub fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
        let path = path::normalize(path.as_ref())?;
        debug!("read_dir {:?}", path);
        MergeView::new(&self.layers).list(&path)
    }

    pub fn mkdir(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;
        let parent = path::parent(&path).ok_or_else(|| Error::AlreadyExists(path.clone()))?;
        self.require_dir(parent)?;
        if self.try_resolve(&path)?.is_some() {
            return Err(Error::AlreadyExists(path));
        }
        self.make_dir(upper, &path, mode)
    }

    /// Create a directory and any missing parents
    ///
    /// New parents get the same mode as the leaf.
    pub fn mkdir_all(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;

        let mut chain = path::ancestors(&path);
        chain.push(&path);
        for dir in chain.into_iter().skip(1) {
            match self.try_resolve(dir)? {
                Some(lookup) if lookup.is_dir() => {}
                Some(_) => return Err(Error::NotADirectory(dir.to_path_buf())),
                None => self.make_dir(upper, dir, mode)?,
            }
        }
        Ok(())
    }

    /// Create one directory in upper; the parent is known to be visible
    fn make_dir(&self, upper: &Layer, path: &Path, mode: u32) -> Result<()> {
        check_name(path)?;
        let resurrected = whiteout::unmark(upper.root(), path)?;
        self.copy_up().ensure_parents(path)?;
        sys::create_dir(&upper.join(path), mode).map_err(|e| Error::at(path, e))?;

        // A re-created directory must not show its old lower contents
        if resurrected {
            whiteout::mark_opaque(upper.root(), path)?;
        }
        debug!("mkdir {:?} mode {:o}", path, mode);
        Ok(())
    }

    /// Remove a file, symlink or empty directory
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;
        if path::is_root(&path) {
            return Err(Error::InvalidPath(path));
        }
        self.remove_entry(upper, &path)
    }

    fn remove_entry(&self, upper: &Layer, path: &Path) -> Result<()> {
        let lookup = self.resolver().resolve(path)?;
        if lookup.is_dir() && !self.read_dir(path)?.is_empty() {
            return Err(Error::DirectoryNotEmpty(path.to_path_buf()));
        }

        if lookup.is_upper {
            let physical = upper.join(path);
            let removed = if lookup.is_dir() {
                // Only markers can be left inside
                fs::remove_dir_all(&physical)
            } else {
                fs::remove_file(&physical)
            };
            removed.map_err(|e| Error::at(path, e))?;
        }

        self.copy_up().ensure_parents(path)?;
        whiteout::mark_deleted(upper.root(), path)?;
        debug!("remove {:?}", path);
        Ok(())
    }

    /// Remove a path and everything below it; absent paths are not an error
    pub fn remove_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;
        let Some(lookup) = self.try_resolve(&path)? else {
            return Ok(());
        };

        if lookup.is_dir() {
            self.remove_children(upper, &path)?;
        }
        if !path::is_root(&path) {
            self.remove_entry(upper, &path)?;
        }
        Ok(())
    }

    /// Remove the merged contents of a directory, bottom-up
    fn remove_children(&self, upper: &Layer, dir: &Path) -> Result<()> {
        for entry in self.read_dir(dir)? {
            if entry.is_dir() {
                self.remove_children(upper, &entry.path)?;
            }
            self.remove_entry(upper, &entry.path)?;
        }
        Ok(())
    }

    /// Rename an entry
    ///
    /// Entries only present in lower layers are copied to the new name; the old
    /// name is always tombstoned so lower copies cannot resurface.
    pub fn rename(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
        let old = path::normalize(old.as_ref())?;
        let new = path::normalize(new.as_ref())?;
        let upper = self.writable(&old)?;

        if path::is_root(&old) || path::is_root(&new) {
            return Err(Error::InvalidPath(old));
        }
        check_name(&new)?;

        let lookup = self.resolver().resolve(&old)?;
        if old == new {
            return Ok(());
        }
        if new.starts_with(&old) {
            return Err(Error::InvalidPath(new));
        }
        let parent = path::parent(&new).ok_or_else(|| Error::InvalidPath(new.clone()))?;
        self.require_dir(parent)?;

        self.rename_entry(upper, &old, lookup, &new)?;
        debug!("rename {:?} -> {:?}", old, new);
        Ok(())
    }

    fn rename_entry(&self, upper: &Layer, old: &Path, lookup: Lookup, new: &Path) -> Result<()> {
        self.clear_destination(upper, &lookup, new)?;
        whiteout::unmark(upper.root(), new)?;
        self.copy_up().ensure_parents(new)?;

        if lookup.is_dir() && self.contributors(old)? > 1 {
            // Merged directory: move it child by child
            sys::create_dir(&upper.join(new), sys::mode_of(&lookup.metadata))
                .map_err(|e| Error::at(new, e))?;
            whiteout::mark_opaque(upper.root(), new)?;
            for entry in self.read_dir(old)? {
                let child = self.resolver().resolve(&entry.path)?;
                self.rename_entry(upper, &entry.path, child, &new.join(&entry.name))?;
            }
            return self.remove_entry(upper, old);
        }

        if lookup.is_upper {
            fs::rename(upper.join(old), upper.join(new)).map_err(|e| Error::at(old, e))?;
        } else {
            self.copy_up().duplicate(old, &lookup, new)?;
        }
        if lookup.is_dir() {
            whiteout::mark_opaque(upper.root(), new)?;
        }

        self.copy_up().ensure_parents(old)?;
        whiteout::mark_deleted(upper.root(), old)
    }

    /// Make room at a rename destination, following `rename(2)` rules
    fn clear_destination(&self, upper: &Layer, source: &Lookup, new: &Path) -> Result<()> {
        let Some(dest) = self.try_resolve(new)? else {
            return Ok(());
        };
        if dest.is_dir() && !source.is_dir() {
            return Err(Error::IsADirectory(new.to_path_buf()));
        }
        if !dest.is_dir() && source.is_dir() {
            return Err(Error::NotADirectory(new.to_path_buf()));
        }
        self.remove_entry(upper, new)
    }

    /// Number of layers contributing to `path`
    fn contributors(&self, path: &Path) -> Result<usize> {
        let mut count = 0;
        self.resolver().walk(path, |_, _| {
            count += 1;
            ControlFlow::Continue(())
        })?;
        Ok(count)
    }

    /// Create a symlink at `link` pointing to `target`
    ///
    /// A relative target that resolves inside the union is copied up first.
    pub fn symlink(&self, target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        let link = path::normalize(link.as_ref())?;
        let upper = self.writable(&link)?;
        check_name(&link)?;

        let parent = path::parent(&link).ok_or_else(|| Error::AlreadyExists(link.clone()))?;
        self.require_dir(parent)?;
        if self.try_resolve(&link)?.is_some() {
            return Err(Error::AlreadyExists(link));
        }

        if target.is_relative() {
            if let Some(resolved) = path::join_lexical(parent, target) {
                if self.try_resolve(&resolved)?.is_some() {
                    self.copy_up().ensure_upper(&resolved)?;
                }
            }
        }

        whiteout::unmark(upper.root(), &link)?;
        self.copy_up().ensure_parents(&link)?;
        sys::symlink(target, &upper.join(&link)).map_err(|e| Error::at(&link, e))?;
        debug!("symlink {:?} -> {:?}", link, target);
        Ok(())
    }

    /// Change permission bits, copying the entry up first
    pub fn chmod(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;
        let target = self.follow_for_write(&path)?;
        self.copy_up().ensure_upper(&target)?;
        sys::set_mode(&upper.join(&target), mode).map_err(|e| Error::at(&path, e))?;
        debug!("chmod {:?} {:o}", path, mode);
        Ok(())
    }

    /// Change ownership of the entry itself, copying it up first; `None` keeps an id
    pub fn chown(&self, path: impl AsRef<Path>, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;
        self.copy_up().ensure_upper(&path)?;
        sys::lchown(&upper.join(&path), uid, gid).map_err(|e| Error::at(&path, e))?;
        debug!("chown {:?} {:?}:{:?}", path, uid, gid);
        Ok(())
    }

    /// Truncate or extend a file, copying it up first
    pub fn truncate(&self, path: impl AsRef<Path>, size: u64) -> Result<()> {
        let path = path::normalize(path.as_ref())?;
        let upper = self.writable(&path)?;
        let target = self.follow_for_write(&path)?;
        self.copy_up().ensure_upper(&target)?;

        let file = fs::OpenOptions::new()
            .write(true)
            .open(upper.join(&target))
            .map_err(|e| Error::at(&path, e))?;
        file.set_len(size).map_err(|e| Error::at(&path, e))?;
        debug!("truncate {:?} to {}", path, size);
        Ok(())
    }

    /// Read a whole file
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let mut file = self.open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| Error::at(path, e))?;
        Ok(data)
    }

    /// Replace a file's contents, creating it with `mode` if needed
    pub fn write_file(&self, path: impl AsRef<Path>, data: &[u8], mode: u32) -> Result<()> {
        let path = path.as_ref();
        let mut file = self.open_with(
            path,
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode),
        )?;
        file.write_all(data).map_err(|e| Error::at(path, e))?;
        Ok(())
    }
}

/// Reject names reserved for whiteout markers
fn check_name(path: &Path) -> Result<()> {
    match path.file_name() {
        Some(name) if whiteout::is_whiteout_name(name) => Err(Error::InvalidPath(path.to_path_buf())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        upper: TempDir,
        lower1: TempDir,
        lower2: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                upper: tempdir().unwrap(),
                lower1: tempdir().unwrap(),
                lower2: tempdir().unwrap(),
            }
        }

        /// lower1 has the higher priority of the two lower layers
        fn union(&self) -> UnionFs {
            UnionFs::new(LayerStack::new(
                Some(self.upper.path().to_path_buf()),
                vec![self.lower2.path().to_path_buf(), self.lower1.path().to_path_buf()],
            ))
        }

        fn read_only(&self) -> UnionFs {
            UnionFs::new(LayerStack::new(
                None,
                vec![self.lower2.path().to_path_buf(), self.lower1.path().to_path_buf()],
            ))
        }
    }

    fn names(entries: &[DirEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.name.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_lookup_precedence() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("server.properties"), b"motd=lower").unwrap();
        fs::write(fx.upper.path().join("server.properties"), b"motd=upper!").unwrap();

        let union = fx.union();
        assert_eq!(union.stat("server.properties").unwrap().len(), 11);
        assert_eq!(union.read_file("/server.properties").unwrap(), b"motd=upper!");
    }

    #[test]
    fn test_deletion_hides_not_erases() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("world")).unwrap();
        fs::write(fx.lower1.path().join("world/session.lock"), b"lock").unwrap();
        fs::write(fx.lower1.path().join("world/level.dat"), b"level").unwrap();

        let union = fx.union();
        union.remove("world/session.lock").unwrap();

        assert!(union.stat("world/session.lock").unwrap_err().is_not_found());
        assert_eq!(names(&union.read_dir("world").unwrap()), vec!["level.dat"]);
        assert!(fx.lower1.path().join("world/session.lock").exists());
    }

    #[test]
    fn test_undelete_then_create() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("eula.txt"), b"eula=false").unwrap();

        let union = fx.union();
        union.remove("eula.txt").unwrap();

        let mut file = union
            .open_with("eula.txt", OpenOptions::new().write(true).create(true))
            .unwrap();
        file.write_all(b"ok").unwrap();
        drop(file);

        assert_eq!(union.read_file("eula.txt").unwrap(), b"ok");
        assert!(!whiteout::is_deleted(fx.upper.path(), Path::new("eula.txt")));
    }

    #[test]
    fn test_whited_out_name_needs_create() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("whitelist.json"), b"[]").unwrap();

        let union = fx.union();
        union.remove("whitelist.json").unwrap();

        assert!(union
            .open_with("whitelist.json", OpenOptions::new().write(true))
            .unwrap_err()
            .is_not_found());
        assert!(union
            .open_with("whitelist.json", OpenOptions::new().append(true))
            .unwrap_err()
            .is_not_found());
        assert!(whiteout::is_deleted(fx.upper.path(), Path::new("whitelist.json")));
        assert!(!fx.upper.path().join("whitelist.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_through_dangling_link() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("logs")).unwrap();
        std::os::unix::fs::symlink("latest.log", fx.lower1.path().join("logs/current")).unwrap();

        let union = fx.union();
        union.write_file("logs/current", b"[INFO] Done", DEFAULT_FILE_MODE).unwrap();

        assert_eq!(union.read_file("logs/latest.log").unwrap(), b"[INFO] Done");
        assert_eq!(union.read_file("logs/current").unwrap(), b"[INFO] Done");
        assert!(union.lstat("logs/current").unwrap().file_type().is_symlink());
        assert!(fx.upper.path().join("logs/latest.log").is_file());

        // Without create, a dangling link stays NotFound
        std::os::unix::fs::symlink("missing.log", fx.lower1.path().join("logs/old")).unwrap();
        assert!(union
            .open_with("logs/old", OpenOptions::new().write(true))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_copy_up_isolation() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("a.txt"), b"hello").unwrap();

        let union = fx.union();
        let mut file = union
            .open_with("a.txt", OpenOptions::new().append(true))
            .unwrap();
        file.write_all(b" world").unwrap();
        drop(file);

        assert_eq!(fs::read(fx.upper.path().join("a.txt")).unwrap(), b"hello world");
        assert_eq!(fs::read(fx.lower1.path().join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_read_only_enforcement() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("plugins")).unwrap();
        fs::write(fx.lower1.path().join("a.txt"), b"hello").unwrap();

        let union = fx.read_only();
        assert!(union.is_read_only());

        let denied = |r: Result<()>| matches!(r, Err(Error::PermissionDenied(_)));
        assert!(matches!(
            union.open_with("a.txt", OpenOptions::new().write(true)),
            Err(Error::PermissionDenied(_))
        ));
        assert!(denied(union.mkdir("new", DEFAULT_DIR_MODE)));
        assert!(denied(union.remove("a.txt")));
        assert!(denied(union.rename("a.txt", "b.txt")));
        assert!(denied(union.symlink("a.txt", "link")));

        assert!(union.stat("a.txt").is_ok());
        assert_eq!(union.read_file("a.txt").unwrap(), b"hello");
        assert_eq!(names(&union.read_dir("").unwrap()), vec!["a.txt", "plugins"]);
    }

    #[test]
    fn test_directory_merge_determinism() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("x"), b"x1").unwrap();
        fs::write(fx.lower1.path().join("y"), b"y-lower1").unwrap();
        fs::write(fx.lower2.path().join("y"), b"y2").unwrap();
        fs::write(fx.lower2.path().join("z"), b"z2").unwrap();

        let union = fx.union();
        assert_eq!(names(&union.read_dir(".").unwrap()), vec!["x", "y", "z"]);
        assert_eq!(union.stat("y").unwrap().len(), 8);
        assert_eq!(union.lookup("y").unwrap().layer.root(), fx.lower1.path());
    }

    #[test]
    fn test_mkdir_over_removed_dir_is_empty() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("plugins")).unwrap();
        fs::write(fx.lower1.path().join("plugins/old.jar"), b"old").unwrap();

        let union = fx.union();
        union.remove_all("plugins").unwrap();
        assert!(!union.exists("plugins"));

        union.mkdir("plugins", DEFAULT_DIR_MODE).unwrap();
        assert!(union.read_dir("plugins").unwrap().is_empty());
        assert!(!union.exists("plugins/old.jar"));
        assert!(fx.lower1.path().join("plugins/old.jar").exists());
    }

    #[test]
    fn test_mkdir_all_and_existing() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("world")).unwrap();
        fs::write(fx.lower1.path().join("eula.txt"), b"").unwrap();

        let union = fx.union();
        union.mkdir_all("world/region/backup", DEFAULT_DIR_MODE).unwrap();
        assert!(union.stat("world/region/backup").unwrap().is_dir());
        assert!(fx.upper.path().join("world/region/backup").is_dir());

        assert!(matches!(
            union.mkdir("world", DEFAULT_DIR_MODE),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            union.mkdir_all("eula.txt/sub", DEFAULT_DIR_MODE),
            Err(Error::NotADirectory(_))
        ));
        assert!(union.mkdir("missing/child", DEFAULT_DIR_MODE).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_non_empty_dir() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower2.path().join("logs")).unwrap();
        fs::write(fx.lower2.path().join("logs/latest.log"), b"log").unwrap();

        let union = fx.union();
        assert!(matches!(union.remove("logs"), Err(Error::DirectoryNotEmpty(_))));
        union.remove("logs/latest.log").unwrap();
        union.remove("logs").unwrap();
        assert!(!union.exists("logs"));
        assert!(union.remove("logs").unwrap_err().is_not_found());
        union.remove_all("logs").unwrap();
    }

    #[test]
    fn test_remove_upper_file() {
        let fx = Fixture::new();
        let union = fx.union();
        union.write_file("ops.json", b"[]", DEFAULT_FILE_MODE).unwrap();
        assert!(fx.upper.path().join("ops.json").exists());

        union.remove("ops.json").unwrap();
        assert!(!fx.upper.path().join("ops.json").exists());
        assert!(!union.exists("ops.json"));
    }

    #[test]
    fn test_remove_all_merged_tree() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("world/region")).unwrap();
        fs::write(fx.lower1.path().join("world/region/r.0.0.mca"), b"r").unwrap();
        fs::create_dir_all(fx.lower2.path().join("world")).unwrap();
        fs::write(fx.lower2.path().join("world/level.dat"), b"l").unwrap();

        let union = fx.union();
        union.write_file("world/stats.json", b"{}", DEFAULT_FILE_MODE).unwrap();
        union.remove_all("world").unwrap();

        assert!(!union.exists("world"));
        assert!(union.read_dir("").unwrap().is_empty());
        assert!(fx.lower1.path().join("world/region/r.0.0.mca").exists());
        assert!(fx.lower2.path().join("world/level.dat").exists());
    }

    #[test]
    fn test_rename_lower_only() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("server.jar"), b"jar").unwrap();

        let union = fx.union();
        union.rename("server.jar", "server-old.jar").unwrap();

        assert!(!union.exists("server.jar"));
        assert_eq!(union.read_file("server-old.jar").unwrap(), b"jar");
        assert!(fx.lower1.path().join("server.jar").exists());
        assert!(fx.upper.path().join("server-old.jar").exists());
    }

    #[test]
    fn test_rename_upper_tombstones_old() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("config.yml"), b"lower").unwrap();

        let union = fx.union();
        union.write_file("config.yml", b"upper", DEFAULT_FILE_MODE).unwrap();
        union.rename("config.yml", "config.yml.bak").unwrap();

        // The lower copy must not resurface
        assert!(!union.exists("config.yml"));
        assert_eq!(union.read_file("config.yml.bak").unwrap(), b"upper");
    }

    #[test]
    fn test_rename_merged_directory() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("world")).unwrap();
        fs::write(fx.lower1.path().join("world/level.dat"), b"l").unwrap();
        fs::create_dir_all(fx.lower2.path().join("world")).unwrap();
        fs::write(fx.lower2.path().join("world/icon.png"), b"i").unwrap();

        let union = fx.union();
        union.write_file("world/new.dat", b"n", DEFAULT_FILE_MODE).unwrap();
        union.rename("world", "world_backup").unwrap();

        assert!(!union.exists("world"));
        assert_eq!(
            names(&union.read_dir("world_backup").unwrap()),
            vec!["icon.png", "level.dat", "new.dat"]
        );
    }

    #[test]
    fn test_rename_onto_existing_file() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("a"), b"a").unwrap();
        fs::write(fx.lower2.path().join("b"), b"b").unwrap();
        fs::create_dir_all(fx.lower2.path().join("dir")).unwrap();

        let union = fx.union();
        union.rename("a", "b").unwrap();
        assert_eq!(union.read_file("b").unwrap(), b"a");
        assert!(!union.exists("a"));

        assert!(matches!(union.rename("b", "dir"), Err(Error::IsADirectory(_))));
        assert!(matches!(union.rename("dir", "dir/inner"), Err(Error::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_copies_target_up() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("server.jar"), b"jar").unwrap();

        let union = fx.union();
        union.symlink("server.jar", "current.jar").unwrap();

        assert!(fx.upper.path().join("server.jar").exists());
        assert_eq!(union.read_link("current.jar").unwrap(), PathBuf::from("server.jar"));
        assert!(union.lstat("current.jar").unwrap().file_type().is_symlink());
        assert!(union.stat("current.jar").unwrap().is_file());
        assert_eq!(union.read_file("current.jar").unwrap(), b"jar");
    }

    #[cfg(unix)]
    #[test]
    fn test_stat_follows_relative_link_across_layers() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("versions")).unwrap();
        fs::write(fx.lower2.path().join("paper.jar"), b"paper").unwrap();
        std::os::unix::fs::symlink("../paper.jar", fx.lower1.path().join("versions/latest")).unwrap();

        let union = fx.union();
        assert_eq!(union.stat("versions/latest").unwrap().len(), 5);
        assert_eq!(union.read_file("versions/latest").unwrap(), b"paper");
    }

    #[cfg(unix)]
    #[test]
    fn test_chmod_and_truncate_copy_up() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("start.sh"), b"#!/bin/sh\njava -jar server.jar\n").unwrap();

        let union = fx.union();
        union.chmod("start.sh", 0o755).unwrap();
        assert_eq!(sys::mode_of(&union.stat("start.sh").unwrap()), 0o755);
        assert_ne!(
            sys::mode_of(&fs::metadata(fx.lower1.path().join("start.sh")).unwrap()),
            0o755
        );

        union.truncate("start.sh", 9).unwrap();
        assert_eq!(union.read_file("start.sh").unwrap(), b"#!/bin/sh");
        assert_eq!(fs::read(fx.lower1.path().join("start.sh")).unwrap().len(), 31);
    }

    #[test]
    fn test_create_new_and_reserved_names() {
        let fx = Fixture::new();
        fs::write(fx.lower1.path().join("banned-ips.json"), b"[]").unwrap();

        let union = fx.union();
        assert!(matches!(
            union.open_with(
                "banned-ips.json",
                OpenOptions::new().write(true).create_new(true)
            ),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            union.write_file(".wh.secret", b"", DEFAULT_FILE_MODE),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(union.lookup("../escape"), Err(Error::InvalidPath(_))));
        assert!(union
            .open_with("missing.txt", OpenOptions::new().write(true))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_write_creates_parents_in_upper() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.lower1.path().join("plugins/essentials")).unwrap();

        let union = fx.union();
        union
            .write_file("plugins/essentials/userdata.yml", b"money: 10", DEFAULT_FILE_MODE)
            .unwrap();

        assert!(fx.upper.path().join("plugins/essentials").is_dir());
        assert_eq!(
            union.read_file("plugins/essentials/userdata.yml").unwrap(),
            b"money: 10"
        );
        assert!(union
            .write_file("nothere/file", b"", DEFAULT_FILE_MODE)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_from_config() {
        let fx = Fixture::new();
        let upper = fx.upper.path().join("instance-1");
        let config = OverlayConfig::new(
            Some(upper.clone()),
            vec![fx.lower1.path().to_path_buf()],
        );

        let union = UnionFs::from_config(&config).unwrap();
        assert!(upper.is_dir());
        assert!(!union.is_read_only());

        let missing = OverlayConfig::new(None, vec![fx.lower1.path().join("nope")]);
        assert!(matches!(
            UnionFs::from_config(&missing),
            Err(Error::InvalidConfig(_))
        ));
    }
}
