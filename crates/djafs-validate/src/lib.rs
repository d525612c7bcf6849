//! # djafs-validate
//!
//! Structural and referential integrity checks over `.djfz` archives, and
//! a safe rewrite-and-swap repair path.
//!
//! Validation reports every issue it can find in one pass; repair rewrites
//! the archive to a temp file in the same directory, swaps it in behind a
//! `.bak` of the original, and is guarded by a per-archive on-disk lock
//! file plus a 2x free-space check.

mod repair;

pub use repair::{preview_repair, repair_archive, RepairOptions, RepairStats};

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use djafs_archive::{Archive, ArchiveError, ARCHIVE_EXT, LOOKUP_NAME, METADATA_NAME};

/// Operational failures during validation or repair
#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("insufficient disk space for repair: need {needed} bytes, have {available} bytes")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("archive is locked by another process: {0}")]
    Locked(PathBuf),
}

pub type Result<T> = std::result::Result<T, ValidateError>;

/// One finding from validating an archive. Several can coexist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Container will not open, or an embedded JSON is malformed
    ArchiveCorrupted { context: String },
    /// No `lookups.djfl` entry
    MissingLookup,
    /// No `metadata.djfm` entry
    MissingMetadata,
    /// Blob present in the container but unreferenced by the log
    OrphanedFile { name: String },
    /// Non-tombstone entry pointing at a blob the container lacks
    MissingTarget { target: String },
    /// Metadata count differs from the log-derived value
    MetadataMismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::ArchiveCorrupted { context } => {
                write!(f, "archive is corrupted: {context}")
            }
            ValidationIssue::MissingLookup => write!(f, "missing lookup table (lookups.djfl)"),
            ValidationIssue::MissingMetadata => write!(f, "missing metadata (metadata.djfm)"),
            ValidationIssue::OrphanedFile { name } => {
                write!(f, "orphaned file not referenced in lookup table: {name}")
            }
            ValidationIssue::MissingTarget { target } => {
                write!(f, "lookup table references missing file: {target}")
            }
            ValidationIssue::MetadataMismatch {
                field,
                expected,
                actual,
            } => write!(f, "metadata count mismatch: {field}: expected {expected}, got {actual}"),
        }
    }
}

/// Validate one archive, collecting every detectable issue.
pub fn validate_archive(path: &Path) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut archive = match Archive::open(path) {
        Ok(archive) => archive,
        Err(e) => {
            return vec![ValidationIssue::ArchiveCorrupted {
                context: e.to_string(),
            }]
        }
    };
    let entry_names = archive.entry_names();

    let log = match archive.lookup_log() {
        Ok(log) => Some(log),
        Err(ArchiveError::MissingLookup(_)) => {
            issues.push(ValidationIssue::MissingLookup);
            None
        }
        Err(e) => {
            issues.push(ValidationIssue::ArchiveCorrupted {
                context: e.to_string(),
            });
            None
        }
    };

    let metadata = match archive.metadata() {
        Ok(Some(meta)) => Some(meta),
        Ok(None) => {
            issues.push(ValidationIssue::MissingMetadata);
            None
        }
        Err(e) => {
            issues.push(ValidationIssue::ArchiveCorrupted {
                context: e.to_string(),
            });
            None
        }
    };

    if let Some(log) = &log {
        let mut referenced: Vec<&str> = Vec::new();
        for entry in log.iter() {
            if entry.is_tombstone() {
                continue;
            }
            referenced.push(entry.target.as_str());
            if !entry_names.iter().any(|n| n == &entry.target) {
                issues.push(ValidationIssue::MissingTarget {
                    target: entry.target.clone(),
                });
            }
        }
        for name in &entry_names {
            if name == LOOKUP_NAME || name == METADATA_NAME {
                continue;
            }
            if !referenced.iter().any(|t| t == name) {
                issues.push(ValidationIssue::OrphanedFile { name: name.clone() });
            }
        }

        if let Some(meta) = &metadata {
            let actual_total = log.total_file_count() as u64;
            if actual_total != meta.total_file_count {
                issues.push(ValidationIssue::MetadataMismatch {
                    field: "total_file_count",
                    expected: meta.total_file_count,
                    actual: actual_total,
                });
            }
            let actual_targets = log.target_file_count() as u64;
            if actual_targets != meta.target_file_count {
                issues.push(ValidationIssue::MetadataMismatch {
                    field: "target_file_count",
                    expected: meta.target_file_count,
                    actual: actual_targets,
                });
            }
        }
    }

    issues
}

/// Validation report for one archive in a storage tree.
#[derive(Debug)]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub issues: Vec<ValidationIssue>,
}

/// Validate every `.djfz` archive under `storage_path`.
pub fn validate_storage(storage_path: &Path) -> Result<Vec<ArchiveReport>> {
    let mut reports = Vec::new();
    for entry in WalkDir::new(storage_path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_archive = entry
            .path()
            .extension()
            .map(|ext| ext == ARCHIVE_EXT)
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        reports.push(ArchiveReport {
            path: entry.path().to_path_buf(),
            issues: validate_archive(entry.path()),
        });
    }
    Ok(reports)
}
