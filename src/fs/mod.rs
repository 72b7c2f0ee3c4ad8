//! Union filesystem engine
//!
//! Merges a writable upper layer and read-only lower layers into one tree,
//! entirely in user space. The mount backends and the generic adapter are
//! built on [`UnionFs`].

pub mod adapter;
pub mod copyup;
pub mod layer;
pub mod merge;
pub mod path;
pub mod resolve;
pub mod sys;
pub mod union;
pub mod whiteout;

pub use adapter::{export, ExportStats, ReadFs, SubFs};
pub use layer::{Layer, LayerStack};
pub use merge::DirEntry;
pub use resolve::Lookup;
pub use union::{OpenOptions, UnionFs, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
