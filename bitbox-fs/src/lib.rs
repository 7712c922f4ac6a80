//! File-tree model and change detection for BitBox.
//!
//! [`FileTreeModel`] keeps a content-addressed index of the watched
//! directory and owns every mutation the sync protocol can perform on it.
//! [`ChangeDetector`] periodically diffs the directory against that index and
//! emits the events the sync engine broadcasts to peers.

pub mod errors;
pub mod model;
pub mod scanner;

pub use errors::{FsError, Result};
pub use model::{describe, FileLoader, FileTreeModel, TreeEntry, SIDECAR_SUFFIX};
pub use scanner::{ChangeDetector, FileSystemEvent};
