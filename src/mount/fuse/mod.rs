//! FUSE-hosted mount backend
//!
//! Serves the user-space union through a FUSE session, for systems without a
//! kernel overlay (or when the caller cannot use one).

mod filesystem;
mod handle;
mod inode;

pub use filesystem::UnionDriver;
pub use handle::{HandleTable, OpenFile};
pub use inode::{InodeTable, ROOT_INO};

use super::MountBackend;
use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::fs::UnionFs;
use fuser::{BackgroundSession, MountOption};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// FUSE mount options for a configuration
pub fn mount_options(config: &MountConfig, read_only: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::AutoUnmount,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if read_only {
        options.push(MountOption::RO);
    }
    options
}

/// A union served through a background FUSE session
pub struct FuseMount {
    union: Arc<UnionFs>,
    target: PathBuf,
    options: Vec<MountOption>,
    session: Mutex<Option<BackgroundSession>>,
}

impl FuseMount {
    pub fn new(union: Arc<UnionFs>, target: impl Into<PathBuf>, config: &MountConfig) -> Self {
        let options = mount_options(config, union.is_read_only());
        Self {
            union,
            target: target.into(),
            options,
            session: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl MountBackend for FuseMount {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn mount(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.target).map_err(|e| Error::at(&self.target, e))?;
        let driver = UnionDriver::new(Arc::clone(&self.union));
        let spawned = fuser::spawn_mount2(driver, &self.target, &self.options).map_err(|e| {
            Error::Mount {
                target: self.target.clone(),
                source: e,
            }
        })?;
        *session = Some(spawned);

        info!("Mounted union at {:?} (fuse)", self.target);
        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        // Dropping the session unmounts and joins the driver thread
        if let Some(session) = self.session.lock().take() {
            drop(session);
            info!("Unmounted {:?} (fuse)", self.target);
        }
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.session.lock().is_some()
    }
}

/// Serve the union at `target` until it is unmounted externally
pub fn mount_foreground(union: Arc<UnionFs>, target: &Path, config: &MountConfig) -> Result<()> {
    let options = mount_options(config, union.is_read_only());
    std::fs::create_dir_all(target).map_err(|e| Error::at(target, e))?;

    info!("Serving union at {:?} (fuse, foreground)", target);
    fuser::mount2(UnionDriver::new(union), target, &options).map_err(|e| Error::Mount {
        target: target.to_path_buf(),
        source: e,
    })
}
