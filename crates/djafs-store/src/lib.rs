//! # djafs-store
//!
//! The on-disk storage engine behind a djafs root.
//!
//! Layout under a storage root:
//!
//! ```text
//! hot_cache/incoming/...          writes land here, mirroring virtual paths
//! hot_cache/staging/...           claimed by the GC cycle before processing
//! work/<bucket>/<subbucket>/...   content-addressed blobs awaiting packing
//! data/...                        lookup logs and .djfz archives
//! ```
//!
//! The write pipeline is incoming → staging → work → archive: the
//! application thread only ever touches `incoming/`; a periodic GC cycle
//! hashes and deduplicates staged files into the work area, appends lookup
//! entries to the governing logs, and a packer folds full work buckets into
//! bucket archives.

mod convert;
mod hotcache;
mod inode;
mod layout;
mod pack;
mod plan;
mod work;

pub use convert::{convert_tree, ConvertOptions, ConvertStats};
pub use hotcache::{GcDriver, GcStats, HotCache};
pub use inode::{
    clear_inode_registry, mint_inode, mint_inode_for, name_for_inode, raise_inode_floor,
    register_inode, registry_len, restore_inode_floor, unregister_inode,
};
pub use layout::StoreLayout;
pub use pack::{pack_all, pack_subbucket};
pub use plan::{count_files_under, plan_boundaries, Boundary};
pub use work::WorkArea;

use std::path::PathBuf;

use thiserror::Error;

use djafs_archive::ArchiveError;
use djafs_hash::HashError;
use djafs_lookup::LookupError;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("expected directory but got file: {0}")]
    ExpectedDirectory(PathBuf),

    #[error("inode {0} not found in registry")]
    InodeNotFound(u64),
}

pub type Result<T> = std::result::Result<T, StoreError>;
