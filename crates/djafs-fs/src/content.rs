//! Blob retrieval.
//!
//! A target identifier fixes where its bytes can live: still loose in the
//! work area, inside the governing root's `files.djfz`, or packed into the
//! bucket archive derived from the identifier. Reads probe in that order,
//! newest home first.

use std::path::Path;

use djafs_archive::{Archive, ArchiveError};
use djafs_store::{StoreLayout, WorkArea};

use crate::{FsError, Result};

const ROOT_ARCHIVE: &str = "files.djfz";

/// Load the bytes behind a resolved entry's target identifier.
pub fn load_entry_bytes(
    layout: &StoreLayout,
    archive_root: &Path,
    target: &str,
) -> Result<Vec<u8>> {
    let work = WorkArea::new(layout.work_dir(), 1);
    if let Some(data) = work.read_blob(target)? {
        return Ok(data);
    }

    let root_archive = archive_root.join(ROOT_ARCHIVE);
    if root_archive.is_file() {
        let mut archive = Archive::open(&root_archive)?;
        match archive.read_blob(target) {
            Ok(data) => return Ok(data),
            Err(ArchiveError::BlobNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let bucket_archive = layout.bucket_archive_path(target).map_err(FsError::Store)?;
    if bucket_archive.is_file() {
        let mut archive = Archive::open(&bucket_archive)?;
        match archive.read_blob(target) {
            Ok(data) => return Ok(data),
            Err(ArchiveError::BlobNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Err(FsError::NotFound(target.to_string()))
}
