//! unionfs - Copy-on-write union filesystem
//!
//! This library merges a writable upper directory over read-only lower
//! directories, either entirely in user space ([`UnionFs`]) or through a
//! native mount (kernel overlay on Linux, FUSE elsewhere on unix).

pub mod config;
pub mod error;
pub mod fs;
pub mod mount;

pub use config::Config;
pub use error::{Error, Result};
pub use fs::UnionFs;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{LayerStack, OpenOptions, ReadFs, UnionFs};
    pub use crate::mount::MountBackend;
}
