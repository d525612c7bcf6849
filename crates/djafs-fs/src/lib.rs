//! # djafs-fs
//!
//! The virtual tree service: composes the storage engine into the two
//! namespaces a mounted djafs root presents.
//!
//! - `/live/...`: read/write; every write funnels through the hot cache
//!   and becomes visible after the GC cycle that drains it.
//! - `/snapshots/<stamp>/...`: read-only views of the tree at a past
//!   instant, derived by filtering the append-only lookup logs.
//!
//! Path resolution uses the dead-end walk: the first ancestor directory of
//! a virtual path that exists in the backing `data/` tree is the archive
//! root governing it.

mod cache;
mod content;
mod resolve;
mod snapshot;
mod tree;

pub use cache::LogCache;
pub use content::load_entry_bytes;
pub use resolve::{resolve_path, Resolved};
pub use snapshot::{list_snapshot_stamps, parse_snapshot_stamp, resolve_at, SnapshotStamp};
pub use tree::{DirEntry, NodeAttr, NodeKind, SetAttr, VirtualTree, DIR_MODE, FILE_MODE};

use thiserror::Error;

use djafs_archive::ArchiveError;
use djafs_lookup::LookupError;
use djafs_store::StoreError;

/// Errors surfaced by the virtual tree service
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

pub type Result<T> = std::result::Result<T, FsError>;
