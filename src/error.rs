//! Error types for unionfs
//!
//! Every path carried by an error is the logical (union-relative) path, never
//! the physical path inside a layer.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for unionfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the union engine and the mount backends
#[derive(Error, Debug)]
pub enum Error {
    /// Path is absent from every layer or masked by a whiteout
    #[error("path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// Mutation on a read-only union, or the OS refused the operation
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("path already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("is a directory: {}", .0.display())]
    IsADirectory(PathBuf),

    #[error("directory not empty: {}", .0.display())]
    DirectoryNotEmpty(PathBuf),

    /// Copy-up hit a file type it cannot duplicate (device, socket, fifo)
    #[error("unsupported file type {kind} at {}", .path.display())]
    InvalidType { path: PathBuf, kind: &'static str },

    /// Path escapes the union root or uses a reserved name
    #[error("invalid path: {}", .0.display())]
    InvalidPath(PathBuf),

    /// Any other OS error, tagged with the logical path it happened on
    #[error("{}: {source}", .path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The platform has no native mount backend
    #[error("overlay not available on this platform")]
    MountUnavailable,

    #[error("mount operation on {} failed: {source}", .target.display())]
    Mount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Translate an OS error into an engine error carrying `path`
    pub fn at(path: impl AsRef<Path>, err: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();

        #[cfg(unix)]
        match err.raw_os_error() {
            Some(libc::ENOTDIR) => return Error::NotADirectory(path),
            Some(libc::EISDIR) => return Error::IsADirectory(path),
            Some(libc::ENOTEMPTY) => return Error::DirectoryNotEmpty(path),
            _ => {}
        }

        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(path),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(path),
            _ => Error::PathIo { path, source: err },
        }
    }

    /// Whether this error means "nothing visible at this path"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// The errno a driver should report for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidType { .. } => libc::EINVAL,
            Error::InvalidPath(_) => libc::EINVAL,
            Error::Unsupported(_) => libc::ENOSYS,
            Error::PathIo { source, .. } | Error::Mount { source, .. } | Error::Io(source) => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            Error::MountUnavailable | Error::Config(_) | Error::InvalidConfig(_) => libc::EIO,
        }
    }
}

/// True for lookups that simply found nothing (including a file used as a directory)
pub(crate) fn is_absent(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::ENOTDIR) {
        return true;
    }
    false
}

/// True when a path component used as a directory is something else
pub(crate) fn is_not_dir(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENOTDIR)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_maps_kinds() {
        let err = Error::at("a/b", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, Error::NotFound(ref p) if p == Path::new("a/b")));

        let err = Error::at("a", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(matches!(err, Error::AlreadyExists(_)));

        let err = Error::at("a", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_at_maps_errno() {
        let err = Error::at("d", io::Error::from_raw_os_error(libc::ENOTEMPTY));
        assert!(matches!(err, Error::DirectoryNotEmpty(_)));
        assert_eq!(err.errno(), libc::ENOTEMPTY);

        let err = Error::at("d", io::Error::from_raw_os_error(libc::EXDEV));
        assert_eq!(err.errno(), libc::EXDEV);
    }

    #[test]
    fn test_message_uses_logical_path() {
        let err = Error::NotFound(PathBuf::from("worlds/level.dat"));
        assert_eq!(err.to_string(), "path does not exist: worlds/level.dat");
    }

    #[test]
    fn test_is_absent() {
        assert!(is_absent(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_absent(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
