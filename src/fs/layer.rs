//! Layer model
//!
//! A union is an ordered stack of read-only lower layers with at most one
//! writable upper layer on top. Lower layers are configured lowest priority
//! first; the effective search order is produced in one place,
//! [`LayerStack::search_order`], and every operation goes through it.

use crate::config::OverlayConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// One directory tree in the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Root path of the layer on the host
    root: PathBuf,
    /// Only the upper layer is writable
    writable: bool,
}

impl Layer {
    /// The writable layer
    pub fn upper(root: impl Into<PathBuf>) -> Self {
        Layer {
            root: root.into(),
            writable: true,
        }
    }

    /// A read-only layer
    pub fn lower(root: impl Into<PathBuf>) -> Self {
        Layer {
            root: root.into(),
            writable: false,
        }
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Resolve a logical path to this layer's physical path
    pub fn join(&self, logical: &Path) -> PathBuf {
        if logical.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(logical)
        }
    }
}

/// The immutable, ordered set of layers making up one union
#[derive(Debug, Clone)]
pub struct LayerStack {
    upper: Option<Layer>,
    /// Lowest priority first
    lower: Vec<Layer>,
}

impl LayerStack {
    /// Create a stack; `lower` is ordered lowest priority first
    pub fn new(upper: Option<PathBuf>, lower: Vec<PathBuf>) -> Self {
        LayerStack {
            upper: upper
                .filter(|p| !p.as_os_str().is_empty())
                .map(Layer::upper),
            lower: lower.into_iter().map(Layer::lower).collect(),
        }
    }

    /// Build a stack from configuration
    pub fn from_config(config: &OverlayConfig) -> Self {
        LayerStack::new(
            config.upper_dir().map(Path::to_path_buf),
            config.lower.clone(),
        )
    }

    /// Check every lower layer is a directory on the host
    pub fn check_lower(&self) -> Result<()> {
        for layer in &self.lower {
            if !layer.root.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "lower layer {:?} is not a directory",
                    layer.root
                )));
            }
        }
        Ok(())
    }

    pub fn upper(&self) -> Option<&Layer> {
        self.upper.as_ref()
    }

    /// Lower layers, lowest priority first
    pub fn lower(&self) -> &[Layer] {
        &self.lower
    }

    /// A union without an upper layer rejects every mutation
    pub fn is_read_only(&self) -> bool {
        self.upper.is_none()
    }

    /// Effective lookup order: upper, then lower layers highest priority first
    pub fn search_order(&self) -> impl DoubleEndedIterator<Item = &Layer> + '_ {
        self.upper.iter().chain(self.lower.iter().rev())
    }

    /// Total number of layers
    pub fn len(&self) -> usize {
        self.lower.len() + usize::from(self.upper.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
