//! # djafs-lookup
//!
//! The append-only lookup log attached to every djafs archive, and the
//! metadata record derived from it.
//!
//! A log is an ordered sequence of entries; updates and deletions are new
//! entries for the same name, a deletion being an entry with an empty
//! `target` (a tombstone). The log is never rewritten in place: the only
//! compaction is an explicit [`LookupLog::collapse`], which keeps the most
//! recent entry per name, tombstones included. This is what makes
//! time-indexed snapshot queries possible.

mod metadata;

pub use metadata::Metadata;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during lookup-log operations
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index {index} out of range for log of {len} entries")]
    IndexOutOfRange { index: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, LookupError>;

/// Version stamp written into generated metadata records.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// One record in a lookup log.
///
/// `name` is the virtual path relative to the archive root, `/`-separated.
/// An empty `target` marks the name as deleted at `modified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    /// Size of the original file in bytes
    pub size: u64,
    /// Inode assigned at ingest
    pub inode: u64,
    /// Modification time of the file (RFC-3339 on the wire)
    pub modified: DateTime<Utc>,
    /// Virtual path relative to the archive root
    pub name: String,
    /// Target identifier of the stored blob; empty for a tombstone
    pub target: String,
}

impl LookupEntry {
    pub fn is_tombstone(&self) -> bool {
        self.target.is_empty()
    }

    /// A deletion marker for `name` at time `modified`.
    pub fn tombstone(name: impl Into<String>, inode: u64, modified: DateTime<Utc>) -> Self {
        Self {
            size: 0,
            inode,
            modified,
            name: name.into(),
            target: String::new(),
        }
    }
}

/// Append-only sequence of [`LookupEntry`] records plus a sorted flag.
///
/// Serializes as `{ "entries": [...], "sorted": bool }`; the flag survives
/// the round trip so a freshly loaded log knows whether it can binary on
/// timestamps without re-sorting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LookupLog {
    entries: Vec<LookupEntry>,
    sorted: bool,
}

impl LookupLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Clears the sorted flag.
    pub fn append(&mut self, entry: LookupEntry) {
        self.sorted = false;
        self.entries.push(entry);
    }

    /// Remove the entry at `index`, returning it.
    pub fn remove(&mut self, index: usize) -> Result<LookupEntry> {
        if index >= self.entries.len() {
            return Err(LookupError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        Ok(self.entries.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&LookupEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Sort entries by `modified` ascending. Stable, so entries appended in
    /// order within one timestamp keep their relative order.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.modified);
        self.sorted = true;
    }

    /// Drop every entry shadowed by a newer entry for the same name.
    ///
    /// Tombstones are retained like any other entry: a collapsed log still
    /// knows which names are deleted. Idempotent.
    pub fn collapse(&mut self) {
        if self.entries.len() <= 1 {
            self.sorted = true;
            return;
        }
        if !self.sorted {
            self.sort();
        }
        let mut latest: HashMap<String, LookupEntry> = HashMap::new();
        for entry in self.entries.drain(..) {
            latest.insert(entry.name.clone(), entry);
        }
        self.entries = latest.into_values().collect();
        self.sort();
    }

    pub fn iter(&self) -> impl Iterator<Item = &LookupEntry> {
        self.entries.iter()
    }

    /// Count of distinct names whose most recent entry is not a tombstone.
    pub fn active_count(&self) -> usize {
        self.latest_by_name()
            .values()
            .filter(|e| !e.is_tombstone())
            .count()
    }

    /// Count of distinct names ever recorded, deleted or not.
    pub fn total_file_count(&self) -> usize {
        let mut names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    }

    /// Count of distinct blob targets referenced by non-tombstone entries.
    pub fn target_file_count(&self) -> usize {
        let mut targets: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| !e.is_tombstone())
            .map(|e| e.target.as_str())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets.len()
    }

    /// Sum of original byte lengths over all entries.
    pub fn uncompressed_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Timestamp of the oldest entry. Sorts the log first if needed.
    pub fn oldest_ts(&mut self) -> Option<DateTime<Utc>> {
        if !self.sorted {
            self.sort();
        }
        self.entries.first().map(|e| e.modified)
    }

    /// Timestamp of the newest entry. Sorts the log first if needed.
    pub fn newest_ts(&mut self) -> Option<DateTime<Utc>> {
        if !self.sorted {
            self.sort();
        }
        self.entries.last().map(|e| e.modified)
    }

    /// The most recent entry per name, keyed by name.
    pub fn latest_by_name(&self) -> HashMap<&str, &LookupEntry> {
        let mut latest: HashMap<&str, &LookupEntry> = HashMap::new();
        for entry in &self.entries {
            match latest.get(entry.name.as_str()) {
                Some(existing) if existing.modified > entry.modified => {}
                _ => {
                    latest.insert(entry.name.as_str(), entry);
                }
            }
        }
        latest
    }

    /// Load a log from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Save the log to a JSON file, replacing any existing content.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}
