//! Lookup-log cache.
//!
//! Maps an archive-root log path to its parsed log plus the file mtime it
//! was loaded at. Entries revalidate against the mtime on every access, so
//! appends committed by a GC cycle are picked up without an explicit
//! invalidation channel. Callers borrow logs for the duration of a closure
//! and never retain references across cycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use djafs_lookup::LookupLog;

use crate::Result;

struct CachedLog {
    log: LookupLog,
    loaded_mtime: SystemTime,
}

/// Read-mostly cache of parsed lookup logs.
#[derive(Default)]
pub struct LogCache {
    entries: RwLock<HashMap<PathBuf, CachedLog>>,
}

impl LogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the log at `path`, loading or reloading it first if
    /// the on-disk file is newer than the cached copy.
    pub fn with_log<T>(&self, path: &Path, f: impl FnOnce(&LookupLog) -> T) -> Result<T> {
        let mtime = std::fs::metadata(path)?.modified()?;

        {
            let entries = self.entries.read().expect("log cache poisoned");
            if let Some(cached) = entries.get(path) {
                if cached.loaded_mtime >= mtime {
                    return Ok(f(&cached.log));
                }
            }
        }

        let log = LookupLog::load(path)?;
        let mut entries = self.entries.write().expect("log cache poisoned");
        entries.insert(
            path.to_path_buf(),
            CachedLog {
                log,
                loaded_mtime: mtime,
            },
        );
        let cached = entries.get(path).expect("log just inserted");
        Ok(f(&cached.log))
    }

    /// Drop a cached log, forcing a reload on next access.
    pub fn invalidate(&self, path: &Path) {
        self.entries
            .write()
            .expect("log cache poisoned")
            .remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("log cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
