//! Content-addressed work area.
//!
//! Blobs land at `work/<bucket>/<subbucket>/<target-id>` between ingest and
//! packing. The bucket is fixed by the content hash; the subbucket spills
//! upward when a directory reaches the configured fill threshold, and the
//! chosen subbucket is burned into the target identifier so the blob's
//! location stays computable from the identifier alone.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::Result;

/// Handle on the bucketed work directory.
#[derive(Debug, Clone)]
pub struct WorkArea {
    root: PathBuf,
    fill_threshold: usize,
}

impl WorkArea {
    pub fn new<P: AsRef<Path>>(root: P, fill_threshold: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            fill_threshold: fill_threshold.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path a target identifier maps to inside the work area.
    pub fn blob_path(&self, target_id: &str) -> Result<PathBuf> {
        let prefix = djafs_hash::work_prefix(target_id)?;
        Ok(self.root.join(prefix).join(target_id))
    }

    /// Copy `src` into the work area under its content hash, returning the
    /// target identifier.
    ///
    /// Deduplicates by identifier: if any subbucket already holds this hash
    /// the existing identifier is returned and nothing is copied. Otherwise
    /// the blob goes to the first subbucket with room, written to a temp
    /// name and renamed into place.
    #[instrument(skip(self), level = "debug")]
    pub fn store_file(&self, src: &Path, hash: &str) -> Result<String> {
        let mut subbucket = 0u32;
        loop {
            let id = djafs_hash::target_of(hash, subbucket);
            let dest = self.blob_path(&id)?;
            if dest.exists() {
                return Ok(id);
            }

            let dir = dest.parent().expect("blob path has a parent");
            let occupied = match fs::read_dir(dir) {
                Ok(entries) => entries.filter_map(|e| e.ok()).count(),
                Err(_) => 0,
            };
            if occupied >= self.fill_threshold {
                subbucket += 1;
                continue;
            }

            fs::create_dir_all(dir)?;
            let temp = dest.with_file_name(format!(
                "{}.{}.{:?}.tmp",
                id,
                std::process::id(),
                std::thread::current().id()
            ));
            let mut out = File::create(&temp)?;
            let mut input = File::open(src)?;
            io::copy(&mut input, &mut out)?;
            out.sync_all()?;
            drop(out);

            if let Err(e) = fs::rename(&temp, &dest) {
                let _ = fs::remove_file(&temp);
                // Lost a race against another writer of the same content.
                if dest.exists() {
                    return Ok(id);
                }
                return Err(e.into());
            }
            return Ok(id);
        }
    }

    /// Read a blob back out of the work area, if it is still there.
    pub fn read_blob(&self, target_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(target_id)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every populated `work/<bucket>/<subbucket>` directory.
    pub fn list_subbuckets(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let buckets = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for bucket in buckets.filter_map(|e| e.ok()) {
            if !bucket.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for sub in fs::read_dir(bucket.path())?.filter_map(|e| e.ok()) {
                if sub.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    out.push(sub.path());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage(temp: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_store_and_read() {
        let temp = TempDir::new().unwrap();
        let work = WorkArea::new(temp.path().join("work"), 5000);

        let src = stage(&temp, "src.json", b"{\"a\":1}");
        let hash = djafs_hash::hash_file(&src).unwrap();
        let id = work.store_file(&src, &hash).unwrap();

        assert_eq!(work.read_blob(&id).unwrap().unwrap(), b"{\"a\":1}");
        assert!(work.blob_path(&id).unwrap().exists());
    }

    #[test]
    fn test_store_deduplicates() {
        let temp = TempDir::new().unwrap();
        let work = WorkArea::new(temp.path().join("work"), 5000);

        let src1 = stage(&temp, "one.json", b"same bytes");
        let src2 = stage(&temp, "two.json", b"same bytes");
        let hash = djafs_hash::hash_file(&src1).unwrap();

        let id1 = work.store_file(&src1, &hash).unwrap();
        let id2 = work.store_file(&src2, &hash).unwrap();
        assert_eq!(id1, id2);

        let subbuckets = work.list_subbuckets().unwrap();
        assert_eq!(subbuckets.len(), 1);
        let blobs: Vec<_> = fs::read_dir(&subbuckets[0]).unwrap().collect();
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn test_spill_to_next_subbucket() {
        let temp = TempDir::new().unwrap();
        // Threshold of 1: the second distinct blob landing in the same
        // bucket must spill to subbucket 1.
        let work = WorkArea::new(temp.path().join("work"), 1);

        // Find two distinct payloads whose hashes share a bucket.
        let mut by_bucket: std::collections::HashMap<u32, (PathBuf, String)> =
            std::collections::HashMap::new();
        let mut pair = None;
        for i in 0..10_000u32 {
            let src = stage(&temp, &format!("f{i}.json"), format!("{i}").as_bytes());
            let hash = djafs_hash::hash_file(&src).unwrap();
            let bucket = djafs_hash::parse_id(&djafs_hash::target_of(&hash, 0))
                .unwrap()
                .bucket;
            if let Some((prev_src, prev_hash)) = by_bucket.get(&bucket) {
                pair = Some(((prev_src.clone(), prev_hash.clone()), (src, hash)));
                break;
            }
            by_bucket.insert(bucket, (src, hash));
        }
        let ((src1, hash1), (src2, hash2)) = pair.expect("no bucket collision in 10k tries");

        let id1 = work.store_file(&src1, &hash1).unwrap();
        let id2 = work.store_file(&src2, &hash2).unwrap();

        let (b1, s1) = djafs_hash::bucket_of(&id1).unwrap();
        let (b2, s2) = djafs_hash::bucket_of(&id2).unwrap();
        assert_eq!(b1, b2);
        assert_eq!(s1, 0);
        assert_eq!(s2, 1);
    }

    #[test]
    fn test_read_missing_blob_is_none() {
        let temp = TempDir::new().unwrap();
        let work = WorkArea::new(temp.path().join("work"), 5000);
        let id = djafs_hash::target_of(&djafs_hash::hash_bytes(b"ghost"), 0);
        assert!(work.read_blob(&id).unwrap().is_none());
    }
}
