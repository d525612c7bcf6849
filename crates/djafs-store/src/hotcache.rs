//! Hot-cache write pipeline.
//!
//! `write_file` puts bytes under `hot_cache/incoming/` mirroring the virtual
//! path and returns once they are durable there. A periodic GC cycle then
//! claims incoming files by renaming them into `hot_cache/staging/`, hashes
//! and deduplicates them into the work area in parallel, and appends lookup
//! entries to the governing logs in `modified` order. Failed tasks are
//! logged and left in staging; hash dedup makes the retry on the next cycle
//! idempotent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use djafs_config::Config;
use djafs_lookup::{LookupEntry, LookupLog};

use crate::layout::{StoreLayout, LOOKUP_FILE};
use crate::{inode, pack, Result, WorkArea};

/// Outcome of one GC cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Files claimed from incoming
    pub staged: usize,
    /// Files fully processed into the work area and logs
    pub processed: usize,
    /// Files that failed and were left in staging for the next cycle
    pub failed: usize,
}

/// Write buffer and GC pipeline for one storage root.
pub struct HotCache {
    layout: StoreLayout,
    work: WorkArea,
    threads: usize,
    gc_lock: Mutex<()>,
}

impl HotCache {
    pub fn new(layout: StoreLayout, config: &Config) -> Result<Self> {
        layout.init()?;
        let work = WorkArea::new(layout.work_dir(), config.archive.bucket_fill_threshold);
        let threads = config.gc.threads.unwrap_or_else(num_cpus::get).max(1);
        Ok(Self {
            layout,
            work,
            threads,
            gc_lock: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn work(&self) -> &WorkArea {
        &self.work
    }

    /// Buffer a write. Returns once the bytes are durable under
    /// `hot_cache/incoming/`; the name becomes visible under `/live` after
    /// the GC cycle that drains it.
    pub fn write_file(&self, virtual_path: &str, data: &[u8]) -> Result<()> {
        let rel = clean_rel(virtual_path);
        let dest = self.layout.incoming_dir().join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&dest)?;
        std::io::Write::write_all(&mut file, data)?;
        file.sync_all()?;
        debug!(path = %rel, bytes = data.len(), "buffered write to incoming");
        Ok(())
    }

    /// Record a deletion by appending a tombstone to the governing log.
    pub fn delete_file(&self, virtual_path: &str) -> Result<()> {
        let rel = clean_rel(virtual_path);
        let _guard = self.gc_lock.lock().expect("gc lock poisoned");

        let log_path = governing_log_path(&self.layout.data_dir(), &rel);
        let name = name_within_root(&self.layout.data_dir(), &log_path, &rel);
        let mut log = load_or_new(&log_path)?;
        let inode = inode::mint_inode_for(&rel);
        log.append(LookupEntry::tombstone(name, inode, Utc::now()));
        save_log(&log_path, &log)?;
        debug!(path = %rel, "appended tombstone");
        Ok(())
    }

    /// Run one GC cycle: claim incoming files, process them into the work
    /// area, and commit lookup entries. Per-file failures are logged and
    /// skipped; the cycle itself only fails on claim-phase errors.
    pub fn run_gc_cycle(&self) -> Result<GcStats> {
        let _guard = self.gc_lock.lock().expect("gc lock poisoned");

        let claimed = self.claim_incoming()?;
        if claimed.is_empty() {
            return Ok(GcStats::default());
        }
        let mut stats = GcStats {
            staged: claimed.len(),
            ..GcStats::default()
        };

        // Hashing and the work-area copy are embarrassingly parallel; the
        // log appends below stay serial so entries for one path land in
        // modified order.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("djafs-gc-{}", i))
            .build()
            .expect("failed to build gc pool");

        let outcomes: Vec<(StagedFile, Result<ProcessedFile>)> = pool.install(|| {
            claimed
                .into_par_iter()
                .map(|staged| {
                    let result = self.process_one(&staged);
                    (staged, result)
                })
                .collect()
        });

        let mut processed = Vec::new();
        for (staged, outcome) in outcomes {
            match outcome {
                Ok(done) => processed.push(done),
                Err(crate::StoreError::Hash(djafs_hash::HashError::UnexpectedSymlink(_))) => {
                    warn!(path = %staged.rel, "skipping unsupported symlink");
                    let _ = std::fs::remove_file(&staged.abs);
                    prune_empty_parents(staged.abs.parent(), &self.layout.staging_dir());
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!(path = %staged.rel, error = %e, "gc task failed; left in staging");
                    stats.failed += 1;
                }
            }
        }
        processed.sort_by_key(|p| p.modified);

        if let Err(e) = self.commit(&mut processed, &mut stats) {
            warn!(error = %e, "gc commit failed");
        }
        info!(
            staged = stats.staged,
            processed = stats.processed,
            failed = stats.failed,
            "gc cycle complete"
        );
        Ok(stats)
    }

    /// Pack every populated work subbucket into its bucket archive.
    /// Serialized against GC cycles by the same lock.
    pub fn pack_work_area(&self) -> Result<usize> {
        let _guard = self.gc_lock.lock().expect("gc lock poisoned");
        pack::pack_all(&self.layout, self.threads)
    }

    /// Move every file under incoming/ into staging/, preserving relative
    /// paths. The same-path rename guarantees at most one task per virtual
    /// path per cycle.
    fn claim_incoming(&self) -> Result<Vec<StagedFile>> {
        let incoming = self.layout.incoming_dir();
        let staging = self.layout.staging_dir();

        let pending: Vec<PathBuf> = walkdir::WalkDir::new(&incoming)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() || e.file_type().is_symlink())
            .map(|e| e.into_path())
            .collect();

        let mut claimed = Vec::new();
        for path in pending {
            let rel = match path.strip_prefix(&incoming) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let dest = staging.join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if let Err(e) = std::fs::rename(&path, &dest) {
                warn!(path = %rel.display(), error = %e, "failed to stage incoming file");
                continue;
            }
            prune_empty_parents(path.parent(), &incoming);
            claimed.push(StagedFile {
                abs: dest,
                rel: rel.to_string_lossy().replace('\\', "/"),
            });
        }
        Ok(claimed)
    }

    fn process_one(&self, staged: &StagedFile) -> Result<ProcessedFile> {
        // hash_file rejects symlinks and directories up front.
        let hash = djafs_hash::hash_file(&staged.abs)?;
        let target = self.work.store_file(&staged.abs, &hash)?;

        let meta = std::fs::metadata(&staged.abs)?;
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(ProcessedFile {
            staged: staged.abs.clone(),
            rel: staged.rel.clone(),
            target,
            size: meta.len(),
            modified,
        })
    }

    /// Append lookup entries for processed files, mirror them into the work
    /// bucket logs for the packer, and clear the staging copies.
    fn commit(&self, processed: &mut [ProcessedFile], stats: &mut GcStats) -> Result<()> {
        let data_dir = self.layout.data_dir();
        let staging = self.layout.staging_dir();
        let mut logs: HashMap<PathBuf, LookupLog> = HashMap::new();

        for file in processed.iter() {
            let log_path = governing_log_path(&data_dir, &file.rel);
            let name = name_within_root(&data_dir, &log_path, &file.rel);
            let inode = inode::mint_inode_for(&file.rel);

            let entry = LookupEntry {
                size: file.size,
                inode,
                modified: file.modified,
                name,
                target: file.target.clone(),
            };

            if !logs.contains_key(&log_path) {
                logs.insert(log_path.clone(), load_or_new(&log_path)?);
            }
            let log = logs.get_mut(&log_path).expect("log just inserted");
            log.append(entry.clone());

            // The packer embeds this log into the bucket archive so the
            // archive stays self-describing. Names here are full paths
            // relative to the data root.
            let bucket_log_path = self
                .work
                .blob_path(&file.target)?
                .parent()
                .expect("work blob has a parent")
                .join(LOOKUP_FILE);
            if !logs.contains_key(&bucket_log_path) {
                logs.insert(bucket_log_path.clone(), load_or_new(&bucket_log_path)?);
            }
            let bucket_log = logs.get_mut(&bucket_log_path).expect("log just inserted");
            bucket_log.append(LookupEntry {
                name: file.rel.clone(),
                ..entry
            });

            if let Err(e) = std::fs::remove_file(&file.staged) {
                warn!(path = %file.staged.display(), error = %e, "failed to remove staged file");
            }
            prune_empty_parents(file.staged.parent(), &staging);
            stats.processed += 1;
        }

        for (path, log) in &logs {
            save_log(path, log)?;
        }
        Ok(())
    }
}

struct StagedFile {
    abs: PathBuf,
    rel: String,
}

struct ProcessedFile {
    staged: PathBuf,
    rel: String,
    target: String,
    size: u64,
    modified: DateTime<Utc>,
}

/// Strip leading slashes and normalize separators in a virtual path.
fn clean_rel(virtual_path: &str) -> String {
    virtual_path
        .trim_start_matches('/')
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// The lookup log governing `rel` under `data_dir`: the deepest existing
/// ancestor directory carrying a `lookups.djfl`, falling back to a log at
/// the data root itself.
pub(crate) fn governing_log_path(data_dir: &Path, rel: &str) -> PathBuf {
    let full = data_dir.join(rel);
    let mut cur = full.parent().unwrap_or(data_dir).to_path_buf();

    while cur != *data_dir && !cur.is_dir() {
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => break,
        }
    }
    loop {
        let candidate = cur.join(LOOKUP_FILE);
        if candidate.is_file() {
            return candidate;
        }
        if cur == *data_dir {
            return candidate;
        }
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => return data_dir.join(LOOKUP_FILE),
        }
    }
}

/// The entry name for `rel` inside the log at `log_path`: the portion of
/// the virtual path below the log's archive root.
pub(crate) fn name_within_root(data_dir: &Path, log_path: &Path, rel: &str) -> String {
    let root = log_path.parent().unwrap_or(data_dir);
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

fn load_or_new(path: &Path) -> Result<LookupLog> {
    if path.is_file() {
        Ok(LookupLog::load(path)?)
    } else {
        Ok(LookupLog::new())
    }
}

fn save_log(path: &Path, log: &LookupLog) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    log.save(path)?;
    Ok(())
}

/// Remove empty directories from `start` upward, stopping before `stop`.
fn prune_empty_parents(start: Option<&Path>, stop: &Path) {
    let mut cur = match start {
        Some(p) => p.to_path_buf(),
        None => return,
    };
    while cur != *stop && cur.starts_with(stop) {
        match std::fs::read_dir(&cur) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return;
                }
            }
            Err(_) => return,
        }
        if std::fs::remove_dir(&cur).is_err() {
            return;
        }
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => return,
        }
    }
}

/// Background ticker that runs GC cycles until stopped.
///
/// Stopping (or dropping) the driver wakes the thread, waits for any
/// in-flight cycle, and runs one final drain so staged writes are not
/// stranded by shutdown.
pub struct GcDriver {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl GcDriver {
    /// Spawn the GC thread. Each tick runs a cycle and then packs the work
    /// area into bucket archives.
    pub fn spawn(cache: Arc<HotCache>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("djafs-gc".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = cache.run_gc_cycle() {
                                warn!(error = %e, "gc cycle failed");
                            }
                            if let Err(e) = cache.pack_work_area() {
                                warn!(error = %e, "work-area pack failed");
                            }
                        }
                    }
                }
                // Final drain on shutdown.
                if let Err(e) = cache.run_gc_cycle() {
                    warn!(error = %e, "final gc cycle failed");
                }
            })
            .expect("failed to spawn gc thread");
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the ticker and wait for the final drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
