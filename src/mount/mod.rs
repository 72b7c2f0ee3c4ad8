//! Native mount backends
//!
//! A backend binds a union to a host directory. Which one is used is decided
//! from configuration and the build target; callers only see
//! [`MountBackend`].

#[cfg(unix)]
pub mod fuse;
#[cfg(target_os = "linux")]
pub mod kernel;

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::fs::UnionFs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// A way of exposing a union at a mount point
pub trait MountBackend: Send + Sync {
    /// Short backend name for logs and status output
    fn name(&self) -> &'static str;

    /// Bind the union to its target
    fn mount(&self) -> Result<()>;

    /// Release the target; unmounting something not mounted succeeds
    fn unmount(&self) -> Result<()>;

    fn is_mounted(&self) -> bool;
}

/// Backend for platforms without native support
pub struct Unavailable;

impl MountBackend for Unavailable {
    fn name(&self) -> &'static str {
        "none"
    }

    fn mount(&self) -> Result<()> {
        Err(Error::MountUnavailable)
    }

    fn unmount(&self) -> Result<()> {
        Err(Error::MountUnavailable)
    }

    fn is_mounted(&self) -> bool {
        false
    }
}

/// The concrete backend `Auto` stands for on this platform
pub fn effective_kind(kind: BackendKind) -> BackendKind {
    match kind {
        BackendKind::Auto if cfg!(target_os = "linux") => BackendKind::Kernel,
        BackendKind::Auto if cfg!(unix) => BackendKind::Fuse,
        BackendKind::Auto => BackendKind::None,
        other => other,
    }
}

fn target_of(config: &Config) -> Result<PathBuf> {
    config
        .overlay
        .target
        .clone()
        .filter(|t| !t.as_os_str().is_empty())
        .ok_or_else(|| Error::InvalidConfig("mount target is not set".into()))
}

/// Pick the backend for a configuration
///
/// The FUSE backend serves `union` when given, otherwise it opens one from the
/// configuration.
pub fn backend_for(config: &Config, union: Option<Arc<UnionFs>>) -> Result<Box<dyn MountBackend>> {
    let kind = effective_kind(config.mount.backend);
    debug!("Selected mount backend {:?}", kind);

    match kind {
        #[cfg(target_os = "linux")]
        BackendKind::Kernel => Ok(Box::new(kernel::KernelOverlay::new(
            config.overlay.clone(),
            target_of(config)?,
            &config.mount,
        ))),
        #[cfg(unix)]
        BackendKind::Fuse => {
            let target = target_of(config)?;
            let union = match union {
                Some(union) => union,
                None => Arc::new(UnionFs::from_config(&config.overlay)?),
            };
            Ok(Box::new(fuse::FuseMount::new(union, target, &config.mount)))
        }
        _ => {
            let _ = union;
            Ok(Box::new(Unavailable))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;

    #[test]
    fn test_unavailable_backend() {
        let mut config = Config::default();
        config.mount.backend = BackendKind::None;

        let backend = backend_for(&config, None).unwrap();
        assert_eq!(backend.name(), "none");
        assert!(!backend.is_mounted());
        assert!(matches!(backend.mount(), Err(Error::MountUnavailable)));
        assert!(matches!(backend.unmount(), Err(Error::MountUnavailable)));
        assert_eq!(
            Error::MountUnavailable.to_string(),
            "overlay not available on this platform"
        );
    }

    #[test]
    fn test_effective_kind() {
        assert_eq!(effective_kind(BackendKind::Fuse), BackendKind::Fuse);
        assert_eq!(effective_kind(BackendKind::None), BackendKind::None);
        #[cfg(target_os = "linux")]
        assert_eq!(effective_kind(BackendKind::Auto), BackendKind::Kernel);
    }

    #[cfg(unix)]
    #[test]
    fn test_native_backend_needs_target() {
        let lower = tempfile::tempdir().unwrap();
        let config = Config {
            overlay: OverlayConfig::new(None, vec![lower.path().to_path_buf()]),
            ..Default::default()
        };
        assert!(matches!(
            backend_for(&config, None),
            Err(Error::InvalidConfig(_))
        ));

        let mut config = config;
        config.overlay.target = Some(lower.path().join("mnt"));
        config.mount.backend = BackendKind::Fuse;
        let backend = backend_for(&config, None).unwrap();
        assert_eq!(backend.name(), "fuse");
    }
}
