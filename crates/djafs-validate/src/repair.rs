//! Rewrite-and-swap repair.
//!
//! Repair is attempted only when the container itself is readable and the
//! lookup log is present. The rewritten archive keeps every blob referenced
//! by a non-tombstone entry, drops the rest, prunes log entries whose blob
//! is gone (tombstones survive), and regenerates the metadata record. The
//! swap goes original → `.bak`, temp → original; a failed second rename
//! restores the backup.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use djafs_archive::{Archive, ArchiveWriter, LOOKUP_NAME, METADATA_NAME};
use djafs_lookup::{LookupLog, Metadata};

use crate::{Result, ValidateError, ValidationIssue};

/// What a repair pass did (or would do, in preview mode).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub metadata_regenerated: bool,
    pub orphaned_files_removed: usize,
    pub missing_entries_fixed: usize,
}

impl RepairStats {
    pub fn is_noop(&self) -> bool {
        !self.metadata_regenerated
            && self.orphaned_files_removed == 0
            && self.missing_entries_fixed == 0
    }
}

impl std::fmt::Display for RepairStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.metadata_regenerated {
            parts.push("metadata regenerated".to_string());
        }
        if self.orphaned_files_removed > 0 {
            parts.push(format!(
                "{} orphaned files removed",
                self.orphaned_files_removed
            ));
        }
        if self.missing_entries_fixed > 0 {
            parts.push(format!(
                "{} missing entries fixed",
                self.missing_entries_fixed
            ));
        }
        if parts.is_empty() {
            write!(f, "no repairs needed")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Repair options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    /// Delete the `.bak` after a successful swap
    pub remove_backup: bool,
}

/// Compute the stats a repair would produce, without side effects.
pub fn preview_repair(issues: &[ValidationIssue]) -> RepairStats {
    let mut stats = RepairStats::default();
    for issue in issues {
        match issue {
            ValidationIssue::ArchiveCorrupted { .. } | ValidationIssue::MissingLookup => {}
            ValidationIssue::MissingMetadata | ValidationIssue::MetadataMismatch { .. } => {
                stats.metadata_regenerated = true;
            }
            ValidationIssue::OrphanedFile { .. } => stats.orphaned_files_removed += 1,
            ValidationIssue::MissingTarget { .. } => stats.missing_entries_fixed += 1,
        }
    }
    stats
}

/// Repair an archive in place. Returns the zero stats when the issues are
/// unrepairable (corrupted container or absent log) or empty.
pub fn repair_archive(
    path: &Path,
    issues: &[ValidationIssue],
    opts: RepairOptions,
) -> Result<RepairStats> {
    let mut needs_metadata = false;
    let mut needs_cleanup = false;
    for issue in issues {
        match issue {
            ValidationIssue::ArchiveCorrupted { .. } | ValidationIssue::MissingLookup => {
                return Ok(RepairStats::default());
            }
            ValidationIssue::MissingMetadata | ValidationIssue::MetadataMismatch { .. } => {
                needs_metadata = true;
            }
            ValidationIssue::OrphanedFile { .. } | ValidationIssue::MissingTarget { .. } => {
                needs_cleanup = true;
            }
        }
    }
    if !needs_metadata && !needs_cleanup {
        return Ok(RepairStats::default());
    }

    let original_size = fs::metadata(path)?.len();
    let dir = path.parent().unwrap_or(Path::new("."));
    check_free_space(dir, original_size.saturating_mul(2))?;

    let _lock = LockFile::acquire(path)?;

    let mut stats = RepairStats::default();
    let mut archive = Archive::open(path)?;
    let mut log = archive.lookup_log()?;

    // Blobs that live entries reference; everything else is an orphan.
    let valid_targets: Vec<String> = log
        .iter()
        .filter(|e| !e.is_tombstone())
        .map(|e| e.target.clone())
        .collect();

    let temp_path = dir.join(format!("repair-{}.djfz", std::process::id()));
    let result = write_repaired(
        &mut archive,
        &mut log,
        &valid_targets,
        &temp_path,
        original_size,
        needs_cleanup,
        &mut stats,
    );
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    if needs_metadata {
        stats.metadata_regenerated = true;
    }

    // Swap: original -> .bak, temp -> original. Restore on failure.
    let backup_path = path.with_extension("djfz.bak");
    fs::rename(path, &backup_path)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::rename(&backup_path, path);
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    info!(archive = %path.display(), %stats, "repaired archive");

    if opts.remove_backup {
        if let Err(e) = fs::remove_file(&backup_path) {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn write_repaired(
    archive: &mut Archive,
    log: &mut LookupLog,
    valid_targets: &[String],
    temp_path: &Path,
    original_size: u64,
    needs_cleanup: bool,
    stats: &mut RepairStats,
) -> Result<()> {
    let mut writer = ArchiveWriter::create(temp_path)?;

    let mut kept_blobs: Vec<String> = Vec::new();
    for name in archive.entry_names() {
        if name == LOOKUP_NAME || name == METADATA_NAME {
            continue;
        }
        if needs_cleanup && !valid_targets.iter().any(|t| t == &name) {
            stats.orphaned_files_removed += 1;
            debug!(blob = %name, "dropping orphaned blob");
            continue;
        }
        let data = archive.read_blob(&name)?;
        writer.add_blob_bytes(&name, &data)?;
        kept_blobs.push(name);
    }

    if needs_cleanup {
        let mut cleaned = LookupLog::new();
        let mut removed = 0usize;
        for entry in log.iter() {
            if entry.is_tombstone() || kept_blobs.iter().any(|b| b == &entry.target) {
                cleaned.append(entry.clone());
            } else {
                removed += 1;
                debug!(name = %entry.name, target = %entry.target, "dropping entry for missing blob");
            }
        }
        stats.missing_entries_fixed = removed;
        *log = cleaned;
    }
    log.sort();

    writer.write_log(log)?;
    writer.write_metadata(&Metadata::from_log(log, original_size))?;
    writer.finish()?;
    Ok(())
}

fn check_free_space(dir: &Path, needed: u64) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| ValidateError::Io(std::io::Error::other(e)))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < needed {
        return Err(ValidateError::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Exclusive-create lock file beside the archive; removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(archive_path: &Path) -> Result<Self> {
        let path = archive_path.with_extension("djfz.lock");
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(ValidateError::Locked(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate_archive;
    use chrono::{TimeZone, Utc};
    use djafs_lookup::LookupEntry;
    use tempfile::TempDir;

    fn entry(name: &str, target: &str) -> LookupEntry {
        LookupEntry {
            size: 4,
            inode: 1,
            modified: Utc.timestamp_opt(1000, 0).unwrap(),
            name: name.into(),
            target: target.into(),
        }
    }

    /// Archive with entries {a, b}, blobs {t_a, t_b, t_c(orphan)} and no
    /// metadata.
    fn damaged(path: &Path) {
        let mut log = LookupLog::new();
        log.append(entry("a.json", "1-00000-aa"));
        log.append(entry("b.json", "2-00000-bb"));
        let mut w = ArchiveWriter::create(path).unwrap();
        w.add_blob_bytes("1-00000-aa", b"aaaa").unwrap();
        w.add_blob_bytes("2-00000-bb", b"bbbb").unwrap();
        w.add_blob_bytes("3-00000-cc", b"orphan").unwrap();
        w.write_log(&log).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_preview_counts_without_side_effects() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        damaged(&path);
        let before = fs::read(&path).unwrap();

        let issues = validate_archive(&path);
        let stats = preview_repair(&issues);
        assert!(stats.metadata_regenerated);
        assert_eq!(stats.orphaned_files_removed, 1);
        assert_eq!(stats.missing_entries_fixed, 0);

        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!path.with_extension("djfz.bak").exists());
    }

    #[test]
    fn test_repair_removes_orphan_and_regenerates_metadata() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        damaged(&path);
        let pre_repair = fs::read(&path).unwrap();

        let issues = validate_archive(&path);
        let stats = repair_archive(&path, &issues, RepairOptions::default()).unwrap();
        assert!(stats.metadata_regenerated);
        assert_eq!(stats.orphaned_files_removed, 1);

        // The repaired archive is clean.
        assert!(validate_archive(&path).is_empty());
        let mut archive = Archive::open(&path).unwrap();
        assert!(!archive.contains("3-00000-cc"));
        assert_eq!(archive.read_blob("1-00000-aa").unwrap(), b"aaaa");

        // The backup holds the pre-repair bytes.
        let backup = path.with_extension("djfz.bak");
        assert_eq!(fs::read(&backup).unwrap(), pre_repair);
    }

    #[test]
    fn test_repair_drops_entries_for_missing_blobs_keeps_tombstones() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");

        let mut log = LookupLog::new();
        log.append(entry("a.json", "1-00000-aa"));
        log.append(entry("lost.json", "8-00000-ee"));
        log.append(LookupEntry::tombstone(
            "gone.json",
            9,
            Utc.timestamp_opt(2000, 0).unwrap(),
        ));
        let mut w = ArchiveWriter::create(&path).unwrap();
        w.add_blob_bytes("1-00000-aa", b"aaaa").unwrap();
        w.write_log(&log).unwrap();
        w.finish().unwrap();

        let issues = validate_archive(&path);
        let stats = repair_archive(&path, &issues, RepairOptions::default()).unwrap();
        assert_eq!(stats.missing_entries_fixed, 1);

        let mut archive = Archive::open(&path).unwrap();
        let repaired = archive.lookup_log().unwrap();
        assert_eq!(repaired.len(), 2);
        assert!(repaired.iter().any(|e| e.name == "gone.json" && e.is_tombstone()));
        assert!(!repaired.iter().any(|e| e.name == "lost.json"));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        damaged(&path);

        let issues = validate_archive(&path);
        repair_archive(&path, &issues, RepairOptions::default()).unwrap();

        let second = repair_archive(&path, &validate_archive(&path), RepairOptions::default())
            .unwrap();
        assert!(second.is_noop());
        assert!(validate_archive(&path).is_empty());
    }

    #[test]
    fn test_locked_archive_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        damaged(&path);
        fs::write(path.with_extension("djfz.lock"), b"").unwrap();

        let issues = validate_archive(&path);
        assert!(matches!(
            repair_archive(&path, &issues, RepairOptions::default()),
            Err(ValidateError::Locked(_))
        ));
        // Original untouched.
        assert!(!path.with_extension("djfz.bak").exists());
    }

    #[test]
    fn test_unrepairable_issues_are_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk.djfz");
        fs::write(&path, b"not a zip").unwrap();

        let issues = validate_archive(&path);
        let stats = repair_archive(&path, &issues, RepairOptions::default()).unwrap();
        assert!(stats.is_noop());
        assert_eq!(fs::read(&path).unwrap(), b"not a zip");
    }

    #[test]
    fn test_remove_backup_option() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        damaged(&path);

        let issues = validate_archive(&path);
        repair_archive(
            &path,
            &issues,
            RepairOptions {
                remove_backup: true,
            },
        )
        .unwrap();
        assert!(!path.with_extension("djfz.bak").exists());
    }

    #[test]
    fn test_lock_released_after_repair() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        damaged(&path);

        let issues = validate_archive(&path);
        repair_archive(&path, &issues, RepairOptions::default()).unwrap();
        assert!(!path.with_extension("djfz.lock").exists());

        // A second repair can acquire the lock again.
        let again = validate_archive(&path);
        assert!(repair_archive(&path, &again, RepairOptions::default()).is_ok());
    }
}
