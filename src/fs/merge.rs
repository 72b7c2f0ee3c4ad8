//! Directory merge view
//!
//! Unions the entries of one directory across every contributing layer,
//! hiding names tombstoned by a higher layer.

use crate::error::{Error, Result};
use crate::fs::layer::{Layer, LayerStack};
use crate::fs::resolve::Resolver;
use crate::fs::whiteout;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, FileType};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

/// One entry of a merged directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name
    pub name: OsString,
    /// Logical path of the entry
    pub path: PathBuf,
    /// Type as seen in the providing layer (symlinks not followed)
    pub file_type: FileType,
    /// Whether the providing layer is the upper layer
    pub is_upper: bool,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }
}

/// Merged directory listings over a layer stack
pub struct MergeView<'a> {
    resolver: Resolver<'a>,
}

impl<'a> MergeView<'a> {
    pub fn new(layers: &'a LayerStack) -> Self {
        MergeView {
            resolver: Resolver::new(layers),
        }
    }

    /// List `dir`, sorted by name
    pub fn list(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut contributing: Vec<Layer> = Vec::new();
        let mut top_is_dir = None;
        self.resolver.walk(dir, |layer, metadata| {
            top_is_dir.get_or_insert(metadata.is_dir());
            if !metadata.is_dir() {
                return ControlFlow::Break(());
            }
            contributing.push(layer.clone());
            ControlFlow::Continue(())
        })?;

        match top_is_dir {
            None => return Err(Error::NotFound(dir.to_path_buf())),
            Some(false) => return Err(Error::NotADirectory(dir.to_path_buf())),
            Some(true) => {}
        }

        let mut merged: BTreeMap<OsString, DirEntry> = BTreeMap::new();

        // Lowest priority first so higher layers override
        for layer in contributing.iter().rev() {
            let mut masked = Vec::new();

            let entries = fs::read_dir(layer.join(dir)).map_err(|e| Error::at(dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::at(dir, e))?;
                let name = entry.file_name();

                if whiteout::is_whiteout_name(&name) {
                    if let Some(hidden) = whiteout::masked_name(&name) {
                        masked.push(hidden);
                    }
                    continue;
                }

                let file_type = entry.file_type().map_err(|e| Error::at(dir, e))?;
                merged.insert(
                    name.clone(),
                    DirEntry {
                        path: dir.join(&name),
                        name,
                        file_type,
                        is_upper: layer.is_writable(),
                    },
                );
            }

            // Markers win over a same-named entry in their own layer too
            for name in masked {
                merged.remove(&name);
            }
        }

        Ok(merged.into_values().collect())
    }
}
