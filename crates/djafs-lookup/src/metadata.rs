//! Metadata record derived from a lookup log.
//!
//! Regenerated whenever its archive is written; never edited by hand. The
//! field names are part of the on-disk contract. Readers tolerate unknown
//! fields so newer writers can extend the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::{version, LookupLog, Result};

/// Summary of one archive's lookup log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Size in bytes of the archive file holding the log
    pub compressed_size: u64,
    /// Version stamp of the writer
    pub djafs_version: String,
    /// Most recent `modified` across the log
    pub newest_file_ts: DateTime<Utc>,
    /// Oldest `modified` across the log
    pub oldest_file_ts: DateTime<Utc>,
    /// Distinct blob targets referenced by live entries
    pub target_file_count: u64,
    /// Distinct names ever recorded
    pub total_file_count: u64,
    /// Sum of original byte lengths over all entries
    pub uncompressed_size: u64,
}

impl Metadata {
    /// Derive a metadata record from `log`.
    ///
    /// `compressed_size` is the byte size of the archive the log is packed
    /// into; pass 0 when the archive has not been written yet.
    pub fn from_log(log: &mut LookupLog, compressed_size: u64) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            compressed_size,
            djafs_version: version().to_string(),
            newest_file_ts: log.newest_ts().unwrap_or(epoch),
            oldest_file_ts: log.oldest_ts().unwrap_or(epoch),
            target_file_count: log.target_file_count() as u64,
            total_file_count: log.total_file_count() as u64,
            uncompressed_size: log.uncompressed_size(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;
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
