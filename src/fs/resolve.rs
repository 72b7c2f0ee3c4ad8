//! Layer resolver
//!
//! Finds which layer provides a logical path. Layers are visited in the
//! stack's search order; in each one a whiteout on the path (or on one of its
//! ancestors) ends the search, an existing entry is a hit, and an opaque
//! ancestor directory hides everything further down.

use crate::error::{is_absent, is_not_dir, Error, Result};
use crate::fs::layer::{Layer, LayerStack};
use crate::fs::whiteout;
use std::fs::{self, Metadata};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

/// Outcome of resolving one path
#[derive(Debug, Clone)]
pub struct Lookup {
    /// Layer providing the entry
    pub layer: Layer,
    /// `lstat` of the entry in that layer
    pub metadata: Metadata,
    /// Whether the entry already lives in the upper layer
    pub is_upper: bool,
}

impl Lookup {
    /// Physical path of the entry inside its layer
    pub fn physical(&self, logical: &Path) -> PathBuf {
        self.layer.join(logical)
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.metadata.file_type().is_symlink()
    }
}

/// Resolves logical paths against a layer stack
pub struct Resolver<'a> {
    layers: &'a LayerStack,
}

impl<'a> Resolver<'a> {
    pub fn new(layers: &'a LayerStack) -> Self {
        Resolver { layers }
    }

    /// Find the highest-priority layer holding `path`
    pub fn resolve(&self, path: &Path) -> Result<Lookup> {
        let mut found = None;
        self.walk(path, |layer, metadata| {
            found = Some(Lookup {
                is_upper: layer.is_writable(),
                layer: layer.clone(),
                metadata,
            });
            ControlFlow::Break(())
        })?;
        found.ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    /// Visit every layer contributing `path`, highest priority first
    ///
    /// A non-directory hit shadows everything below it, so the walk stops
    /// after it. `visit` may stop the walk early.
    pub fn walk<F>(&self, path: &Path, mut visit: F) -> Result<()>
    where
        F: FnMut(&Layer, Metadata) -> ControlFlow<()>,
    {
        // Marker files themselves never surface
        if path.iter().any(whiteout::is_whiteout_name) {
            return Ok(());
        }

        for layer in self.layers.search_order() {
            if whiteout::is_masked(layer.root(), path) {
                break;
            }

            match fs::symlink_metadata(layer.join(path)) {
                Ok(metadata) => {
                    let is_dir = metadata.is_dir();
                    if visit(layer, metadata).is_break() {
                        return Ok(());
                    }
                    if !is_dir || whiteout::is_opaque(layer.root(), path) {
                        break;
                    }
                }
                // An ancestor is a non-directory here: it shadows lower layers.
                Err(e) if is_not_dir(&e) => break,
                Err(e) if is_absent(&e) => {}
                Err(e) => return Err(Error::at(path, e)),
            }

            if whiteout::has_opaque_ancestor(layer.root(), path) {
                break;
            }
        }
        Ok(())
    }
}
