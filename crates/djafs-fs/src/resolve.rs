//! Dead-end path resolution.
//!
//! Archive roots are placed so that the first ancestor directory of a
//! virtual path that exists in the backing `data/` tree is the archive root
//! governing it. Descending one step too far hits a dead end (a
//! non-existent directory), which by construction means the file, if it
//! exists at all, is named in the nearest surviving ancestor's log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use djafs_lookup::LookupEntry;

use crate::cache::LogCache;
use crate::snapshot::resolve_at;
use crate::{FsError, Result};

const LOOKUP_FILE: &str = "lookups.djfl";

/// A successful resolution: the governing archive and the matched entry.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Directory the governing archive sits in
    pub archive_root: PathBuf,
    /// Path of the governing lookup log
    pub log_path: PathBuf,
    /// The virtual path relative to the archive root
    pub rel_name: String,
    /// The matched entry (never a tombstone)
    pub entry: LookupEntry,
}

/// Resolve a virtual path (relative, no `live/` prefix) to its governing
/// archive and entry, optionally at a snapshot cutoff.
pub fn resolve_path(
    data_dir: &Path,
    rel: &str,
    cache: &LogCache,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Resolved> {
    let mut cur = data_dir.join(rel);
    loop {
        if cur.is_dir() {
            let log_path = cur.join(LOOKUP_FILE);
            if log_path.is_file() {
                let rel_name = name_under_root(data_dir, &cur, rel);
                let entry = cache
                    .with_log(&log_path, |log| resolve_at(log, &rel_name, cutoff).cloned())?;
                return match entry {
                    Some(entry) => Ok(Resolved {
                        archive_root: cur,
                        log_path,
                        rel_name,
                        entry,
                    }),
                    None => Err(FsError::NotFound(rel.to_string())),
                };
            }
        }
        if cur == *data_dir {
            return Err(FsError::NotFound(rel.to_string()));
        }
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => return Err(FsError::NotFound(rel.to_string())),
        }
    }
}

fn name_under_root(data_dir: &Path, root: &Path, rel: &str) -> String {
    let root_rel = root
        .strip_prefix(data_dir)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    if root_rel.is_empty() {
        rel.to_string()
    } else {
        rel.strip_prefix(&format!("{}/", root_rel))
            .unwrap_or(rel)
            .to_string()
    }
}

/// Every lookup log under the data directory.
pub fn all_log_paths(data_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(data_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == LOOKUP_FILE)
        .map(|e| e.into_path())
        .collect()
}

/// The live entries across all logs at `cutoff`, keyed by virtual path
/// relative to the data root. Tombstoned names are absent.
pub fn live_entries(
    data_dir: &Path,
    cache: &LogCache,
    cutoff: Option<DateTime<Utc>>,
) -> Result<HashMap<String, LookupEntry>> {
    let mut out = HashMap::new();
    for log_path in all_log_paths(data_dir) {
        let root = log_path.parent().unwrap_or(data_dir);
        let root_rel = root
            .strip_prefix(data_dir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        let latest: Vec<(String, LookupEntry)> = cache.with_log(&log_path, |log| {
            let mut best: HashMap<&str, &LookupEntry> = HashMap::new();
            for entry in log.iter() {
                if let Some(t) = cutoff {
                    if entry.modified > t {
                        continue;
                    }
                }
                match best.get(entry.name.as_str()) {
                    Some(b) if b.modified >= entry.modified => {}
                    _ => {
                        best.insert(entry.name.as_str(), entry);
                    }
                }
            }
            best.into_values()
                .filter(|e| !e.is_tombstone())
                .map(|e| (e.name.clone(), e.clone()))
                .collect()
        })?;

        for (name, entry) in latest {
            let full = if root_rel.is_empty() {
                name
            } else {
                format!("{}/{}", root_rel, name)
            };
            out.insert(full, entry);
        }
    }
    Ok(out)
}
