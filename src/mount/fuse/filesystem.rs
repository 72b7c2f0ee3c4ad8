//! FUSE driver over the union dispatcher
//!
//! Every callback maps onto one [`UnionFs`] operation; the driver itself only
//! translates inode numbers and file handles.

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR};
use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

use super::handle::HandleTable;
use super::inode::{self, InodeTable};
use crate::error::Error;
use crate::fs::{OpenOptions, UnionFs};

const TTL: Duration = Duration::from_secs(1);

/// FUSE filesystem serving a [`UnionFs`]
pub struct UnionDriver {
    union: Arc<UnionFs>,
    inodes: InodeTable,
    handles: HandleTable,
}

impl UnionDriver {
    pub fn new(union: Arc<UnionFs>) -> Self {
        Self {
            union,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    /// Errno for a failed union operation
    fn errno(op: &str, err: &Error) -> i32 {
        let errno = err.errno();
        if errno == EIO {
            error!("{} failed: {}", op, err);
        } else {
            debug!("{} failed: {}", op, err);
        }
        errno
    }

    /// Attributes of a path, registering its inode
    fn attr_of(&self, path: &Path) -> Result<fuser::FileAttr, Error> {
        let meta = self.union.lstat(path)?;
        Ok(inode::to_attr(self.inodes.get_or_alloc(path), &meta))
    }

    fn reply_entry(&self, op: &str, path: &Path, reply: ReplyEntry) {
        match self.attr_of(path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(Self::errno(op, &e)),
        }
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inodes.child_path(parent, name)
    }
}

impl Filesystem for UnionDriver {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.child(parent, name) {
            Some(path) => self.reply_entry("lookup", &path, reply),
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.lstat(&path) {
            Ok(meta) => reply.attr(&TTL, &inode::to_attr(ino, &meta)),
            Err(e) => reply.error(Self::errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);

        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };

        let result = (|| {
            if let Some(mode) = mode {
                self.union.chmod(&path, mode & 0o7777)?;
            }
            if uid.is_some() || gid.is_some() {
                self.union.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                match fh.and_then(|fh| self.handles.get(fh)) {
                    Some(handle) if handle.is_writable() => handle
                        .file
                        .set_len(size)
                        .map_err(|e| Error::at(&path, e))?,
                    _ => self.union.truncate(&path, size)?,
                }
            }
            self.union.lstat(&path)
        })();

        match result {
            Ok(meta) => reply.attr(&TTL, &inode::to_attr(ino, &meta)),
            Err(e) => reply.error(Self::errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.read_link(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(Self::errno("readlink", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let Some(path) = self.child(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.mkdir(&path, mode & !umask & 0o7777) {
            Ok(()) => self.reply_entry("mkdir", &path, reply),
            Err(e) => reply.error(Self::errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let Some(path) = self.child(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.lstat(&path) {
            Ok(meta) if meta.is_dir() => {
                reply.error(EISDIR);
                return;
            }
            Err(e) => {
                reply.error(Self::errno("unlink", &e));
                return;
            }
            Ok(_) => {}
        }
        match self.union.remove(&path) {
            Ok(()) => {
                self.inodes.forget(&path);
                reply.ok();
            }
            Err(e) => reply.error(Self::errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let Some(path) = self.child(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.lstat(&path) {
            Ok(meta) if !meta.is_dir() => {
                reply.error(ENOTDIR);
                return;
            }
            Err(e) => {
                reply.error(Self::errno("rmdir", &e));
                return;
            }
            Ok(_) => {}
        }
        match self.union.remove(&path) {
            Ok(()) => {
                self.inodes.forget(&path);
                reply.ok();
            }
            Err(e) => reply.error(Self::errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let Some(path) = self.child(parent, link_name) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.symlink(target, &path) {
            Ok(()) => self.reply_entry("symlink", &path, reply),
            Err(e) => reply.error(Self::errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        // RENAME_EXCHANGE and RENAME_NOREPLACE have no union equivalent
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        let (Some(old), Some(new)) = (self.child(parent, name), self.child(newparent, newname))
        else {
            reply.error(ENOENT);
            return;
        };
        match self.union.rename(&old, &new) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(Self::errno("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.union.open_with(&path, &OpenOptions::from_flags(flags)) {
            Ok(file) => {
                let fh = self.handles.open(ino, file, flags);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(Self::errno("open", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let Some(path) = self.child(parent, name) else {
            reply.error(ENOENT);
            return;
        };

        let mut options = OpenOptions::from_flags(flags);
        options.create(true).mode(mode & !umask & 0o7777);
        let mut flags = flags;
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            // Creating needs a writable descriptor on the host
            options.write(true);
            flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }

        let result = self
            .union
            .open_with(&path, &options)
            .and_then(|file| Ok((file, self.attr_of(&path)?)));
        match result {
            Ok((file, attr)) => {
                let fh = self.handles.open(attr.ino, file, flags);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(Self::errno("create", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let Some(handle) = self.handles.get(fh) else {
            reply.error(EBADF);
            return;
        };
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match handle.file.read_at(&mut buf[filled..], offset as u64 + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Failed to read ino {}: {}", ino, e);
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                }
            }
        }
        reply.data(&buf[..filled]);
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, size={})", ino, fh, offset, data.len());

        let Some(handle) = self.handles.get(fh) else {
            reply.error(EBADF);
            return;
        };
        if !handle.is_writable() {
            reply.error(EBADF);
            return;
        }
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        match handle.file.write_all_at(data, offset as u64) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                error!("Failed to write ino {}: {}", ino, e);
                reply.error(e.raw_os_error().unwrap_or(EIO));
            }
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        let Some(handle) = self.handles.get(fh) else {
            reply.error(EBADF);
            return;
        };
        let synced = if datasync {
            handle.file.sync_data()
        } else {
            handle.file.sync_all()
        };
        match synced {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let listing = match self.union.read_dir(&path) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(Self::errno("readdir", &e));
                return;
            }
        };

        let parent_ino = crate::fs::path::parent(&path)
            .map(|p| self.inodes.get_or_alloc(p))
            .unwrap_or(inode::ROOT_INO);

        let mut entries: Vec<(u64, fuser::FileType, std::ffi::OsString)> = vec![
            (ino, fuser::FileType::Directory, ".".into()),
            (parent_ino, fuser::FileType::Directory, "..".into()),
        ];
        entries.extend(listing.into_iter().map(|entry| {
            (
                self.inodes.get_or_alloc(&entry.path),
                inode::file_kind(entry.file_type),
                entry.name,
            )
        }));

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        if mask & libc::W_OK != 0 && self.union.is_read_only() {
            reply.error(libc::EROFS);
            return;
        }
        match self.union.lstat(&path) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(Self::errno("access", &e)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        // Report the layer new data lands in
        let Some(layer) = self.union.layers().search_order().next() else {
            reply.error(ENOENT);
            return;
        };

        match nix::sys::statvfs::statvfs(layer.root()) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => {
                warn!("statfs on {:?} failed: {}", layer.root(), e);
                reply.error(e as i32);
            }
        }
    }
}
