//! Directory layout of a storage root.

use std::path::{Path, PathBuf};

use djafs_archive::ARCHIVE_EXT;

use crate::Result;

/// Name of the plain lookup log sitting at an archive root.
pub const LOOKUP_FILE: &str = "lookups.djfl";
/// Name of the plain metadata record sitting at an archive root.
pub const METADATA_FILE: &str = "metadata.djfm";
/// Name of the self-contained archive sitting at an archive root.
pub const ARCHIVE_FILE: &str = "files.djfz";

/// Path helpers for the fixed directories under a storage root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create every directory the pipeline expects.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(self.incoming_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.work_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("hot_cache").join("incoming")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("hot_cache").join("staging")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Bucket archive holding a packed blob: `data/<bucket>-<subbucket>.djfz`.
    pub fn bucket_archive_path(&self, target_id: &str) -> Result<PathBuf> {
        let stem = djafs_hash::archive_stem(target_id)?;
        Ok(self.data_dir().join(format!("{}.{}", stem, ARCHIVE_EXT)))
    }
}
