//! Bucket packer.
//!
//! Folds a populated work subbucket into its bucket archive
//! `data/<bucket>-<subbucket>.djfz`. A pre-existing archive is merged:
//! its blobs are extracted back into the work directory (newer work files
//! win on name collisions) and its log entries are carried over, then the
//! whole directory is recompressed and swapped into place. The work
//! directory is removed only after the new archive is durable.
//!
//! Callers serialize packing against GC cycles; within one pack run the
//! buckets themselves are processed in parallel.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};

use djafs_archive::{Archive, ArchiveError, ArchiveWriter, ARCHIVE_EXT, LOOKUP_NAME, METADATA_NAME};
use djafs_lookup::{LookupLog, Metadata};

use crate::layout::StoreLayout;
use crate::{Result, WorkArea};

/// Pack every populated work subbucket. Returns the number of archives
/// written; individual bucket failures are logged and skipped.
pub fn pack_all(layout: &StoreLayout, threads: usize) -> Result<usize> {
    let work = WorkArea::new(layout.work_dir(), 1);
    let subbuckets = work.list_subbuckets()?;
    if subbuckets.is_empty() {
        return Ok(0);
    }
    fs::create_dir_all(layout.data_dir())?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.clamp(1, num_cpus::get()))
        .thread_name(|i| format!("djafs-pack-{}", i))
        .build()
        .expect("failed to build pack pool");

    let packed = pool.install(|| {
        subbuckets
            .par_iter()
            .filter_map(|dir| match pack_subbucket(layout, dir) {
                Ok(path) => {
                    debug!(archive = %path.display(), "packed work bucket");
                    Some(())
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to pack work bucket");
                    None
                }
            })
            .count()
    });
    Ok(packed)
}

/// Pack one `work/<bucket>/<subbucket>` directory into its archive.
pub fn pack_subbucket(layout: &StoreLayout, subbucket_dir: &Path) -> Result<PathBuf> {
    let sub = component_name(subbucket_dir)?;
    let bucket = component_name(subbucket_dir.parent().unwrap_or(subbucket_dir))?;
    let archive_path = layout
        .data_dir()
        .join(format!("{}-{}.{}", bucket, sub, ARCHIVE_EXT));

    let work_log_path = subbucket_dir.join(LOOKUP_NAME);
    let mut log = if work_log_path.is_file() {
        LookupLog::load(&work_log_path)?
    } else {
        LookupLog::new()
    };

    // Merge the previous generation of this archive.
    let mut previous_size = 0u64;
    if archive_path.is_file() {
        previous_size = fs::metadata(&archive_path)?.len();
        let mut old = Archive::open(&archive_path)?;
        match old.lookup_log() {
            Ok(old_log) => {
                for entry in old_log.iter() {
                    log.append(entry.clone());
                }
            }
            Err(ArchiveError::MissingLookup(_)) => {}
            Err(e) => return Err(e.into()),
        }
        for name in old.entry_names() {
            if name == LOOKUP_NAME || name == METADATA_NAME {
                continue;
            }
            let dest = subbucket_dir.join(&name);
            if dest.exists() {
                continue;
            }
            let data = old.read_blob(&name)?;
            fs::write(&dest, data)?;
        }
    }
    log.sort();
    let meta = Metadata::from_log(&mut log, previous_size);

    let temp_path = archive_path.with_extension("tmp");
    let mut writer = ArchiveWriter::create_unchecked(&temp_path)?;
    for entry in fs::read_dir(subbucket_dir)?.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == LOOKUP_NAME || name.ends_with(".tmp") {
            continue;
        }
        writer.add_blob(&name, File::open(entry.path())?)?;
    }
    writer.write_log(&log)?;
    writer.write_metadata(&meta)?;
    writer.finish()?;

    fs::rename(&temp_path, &archive_path)?;
    fs::remove_dir_all(subbucket_dir)?;
    prune_bucket_dir(subbucket_dir.parent());
    Ok(archive_path)
}

fn component_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("work path has no file name: {}", path.display()),
            )
            .into()
        })
}

fn prune_bucket_dir(bucket_dir: Option<&Path>) {
    if let Some(dir) = bucket_dir {
        // Only goes through when the last subbucket is gone.
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use djafs_lookup::LookupEntry;
    use tempfile::TempDir;

    fn seed_work_blob(layout: &StoreLayout, data: &[u8], name: &str) -> String {
        let work = WorkArea::new(layout.work_dir(), 5000);
        let src = layout.root().join("seed.tmp");
        fs::write(&src, data).unwrap();
        let hash = djafs_hash::hash_file(&src).unwrap();
        let id = work.store_file(&src, &hash).unwrap();
        fs::remove_file(&src).unwrap();

        let log_path = work.blob_path(&id).unwrap().parent().unwrap().join(LOOKUP_NAME);
        let mut log = if log_path.is_file() {
            LookupLog::load(&log_path).unwrap()
        } else {
            LookupLog::new()
        };
        log.append(LookupEntry {
            size: data.len() as u64,
            inode: crate::mint_inode(),
            modified: Utc::now(),
            name: name.to_string(),
            target: id.clone(),
        });
        log.save(&log_path).unwrap();
        id
    }

    #[test]
    fn test_pack_creates_bucket_archive() {
        let temp = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp.path());
        layout.init().unwrap();

        let id = seed_work_blob(&layout, b"{\"v\":1}", "a/b.json");
        let packed = pack_all(&layout, 2).unwrap();
        assert_eq!(packed, 1);

        // Work area is cleared.
        let work = WorkArea::new(layout.work_dir(), 5000);
        assert!(work.list_subbuckets().unwrap().is_empty());

        // Archive holds the blob, the log, and metadata.
        let archive_path = layout.bucket_archive_path(&id).unwrap();
        let mut archive = Archive::open(&archive_path).unwrap();
        assert_eq!(archive.read_blob(&id).unwrap(), b"{\"v\":1}");
        let log = archive.lookup_log().unwrap();
        assert_eq!(log.len(), 1);
        assert!(archive.metadata().unwrap().is_some());
    }

    #[test]
    fn test_repack_merges_previous_archive() {
        let temp = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp.path());
        layout.init().unwrap();

        let id1 = seed_work_blob(&layout, b"first", "one.json");
        pack_all(&layout, 1).unwrap();

        // Second generation: reuse the same content under a new name so the
        // work blob lands back in the already-packed bucket.
        let id1_again = seed_work_blob(&layout, b"first", "one-copy.json");
        assert_eq!(id1, id1_again);
        pack_all(&layout, 1).unwrap();

        let mut archive = Archive::open(layout.bucket_archive_path(&id1).unwrap()).unwrap();
        assert_eq!(archive.read_blob(&id1).unwrap(), b"first");
        let log = archive.lookup_log().unwrap();
        // Entry from generation one survives alongside the new one.
        assert_eq!(log.len(), 2);
        assert!(log.iter().any(|e| e.name == "one.json"));
        assert!(log.iter().any(|e| e.name == "one-copy.json"));
    }
}
