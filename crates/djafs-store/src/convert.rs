//! Tree converter.
//!
//! Turns an existing directory of small files into a djafs data layout:
//! the boundary planner partitions the tree, then each boundary becomes a
//! self-contained archive root under `data/` carrying a plain
//! `lookups.djfl` + `metadata.djfm` for resolution and a `files.djfz`
//! holding the deduplicated blobs together with embedded copies of both.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use djafs_archive::ArchiveWriter;
use djafs_hash::HashError;
use djafs_lookup::{LookupEntry, LookupLog, Metadata};

use crate::layout::{StoreLayout, ARCHIVE_FILE, LOOKUP_FILE, METADATA_FILE};
use crate::plan::{plan_boundaries, Boundary};
use crate::{inode, Result, StoreError, WorkArea};

/// Converter options.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Plan and count without writing anything
    pub dry_run: bool,
    /// Soft cap on files per archive
    pub target_files_per_archive: usize,
    /// Work subbucket fill threshold
    pub bucket_fill_threshold: usize,
}

/// Converter outcome.
#[derive(Debug, Clone, Default)]
pub struct ConvertStats {
    pub boundaries: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Convert the tree at `input` into archives under `layout`'s data dir.
/// Returns the planned boundaries and what was (or would be) written.
pub fn convert_tree(
    input: &Path,
    layout: &StoreLayout,
    opts: &ConvertOptions,
) -> Result<(Vec<Boundary>, ConvertStats)> {
    if !input.is_dir() {
        return Err(StoreError::ExpectedDirectory(input.to_path_buf()));
    }
    let boundaries = plan_boundaries(input, opts.target_files_per_archive)?;
    let mut stats = ConvertStats {
        boundaries: boundaries.len(),
        ..ConvertStats::default()
    };

    if opts.dry_run {
        for boundary in &boundaries {
            for path in boundary_files(boundary)? {
                let meta = fs::metadata(&path)?;
                stats.files += 1;
                stats.bytes += meta.len();
            }
        }
        return Ok((boundaries, stats));
    }

    layout.init()?;
    let work = WorkArea::new(layout.work_dir(), opts.bucket_fill_threshold);

    for boundary in &boundaries {
        let written = convert_boundary(input, boundary, layout, &work)?;
        stats.files += written.0;
        stats.bytes += written.1;
    }

    // Blobs now live inside the boundary archives; drop the work copies.
    for dir in work.list_subbuckets()? {
        fs::remove_dir_all(&dir)?;
    }
    for entry in fs::read_dir(layout.work_dir())?.filter_map(|e| e.ok()) {
        let _ = fs::remove_dir(entry.path());
    }

    info!(
        boundaries = stats.boundaries,
        files = stats.files,
        bytes = stats.bytes,
        "conversion complete"
    );
    Ok((boundaries, stats))
}

fn convert_boundary(
    input: &Path,
    boundary: &Boundary,
    layout: &StoreLayout,
    work: &WorkArea,
) -> Result<(usize, u64)> {
    let mut log = LookupLog::new();
    let mut files = 0usize;
    let mut bytes = 0u64;

    for path in boundary_files(boundary)? {
        let hash = match djafs_hash::hash_file(&path) {
            Ok(hash) => hash,
            Err(HashError::UnexpectedSymlink(p)) => {
                warn!(path = %p.display(), "skipping unsupported symlink");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let target = work.store_file(&path, &hash)?;

        let meta = fs::metadata(&path)?;
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let name = rel_slash(&path, &boundary.path);
        let virtual_path = rel_slash(&path, input);

        log.append(LookupEntry {
            size: meta.len(),
            inode: inode::mint_inode_for(&virtual_path),
            modified,
            name,
            target,
        });
        files += 1;
        bytes += meta.len();
    }
    log.sort();

    let boundary_rel = boundary
        .path
        .strip_prefix(input)
        .unwrap_or(Path::new(""))
        .to_path_buf();
    let dest_root = layout.data_dir().join(&boundary_rel);
    fs::create_dir_all(&dest_root)?;

    write_archive_root(&dest_root, &mut log, work)?;
    Ok((files, bytes))
}

/// Write `files.djfz` plus the sibling plain log and metadata at an archive
/// root.
fn write_archive_root(dest_root: &Path, log: &mut LookupLog, work: &WorkArea) -> Result<()> {
    let archive_path = dest_root.join(ARCHIVE_FILE);
    let embedded_meta = Metadata::from_log(log, 0);

    let mut writer = ArchiveWriter::create(&archive_path)?;
    let targets: BTreeSet<String> = log
        .iter()
        .filter(|e| !e.is_tombstone())
        .map(|e| e.target.clone())
        .collect();
    for target in &targets {
        let data = work
            .read_blob(target)?
            .ok_or_else(|| StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("work blob missing for {target}"),
            )))?;
        writer.add_blob_bytes(target, &data)?;
    }
    writer.write_log(log)?;
    writer.write_metadata(&embedded_meta)?;
    writer.finish()?;

    let compressed_size = fs::metadata(&archive_path)?.len();
    log.save(dest_root.join(LOOKUP_FILE))?;
    Metadata::from_log(log, compressed_size).save(dest_root.join(METADATA_FILE))?;
    Ok(())
}

/// Files belonging to a boundary: the whole subtree for recursive
/// boundaries, direct children only otherwise. djafs artifacts are skipped
/// so re-converting over an output tree cannot ingest its own logs.
fn boundary_files(boundary: &Boundary) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if boundary.include_subdirs {
        for entry in walkdir::WalkDir::new(&boundary.path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && !is_djafs_artifact(entry.path()) {
                out.push(entry.into_path());
            }
        }
    } else {
        for entry in fs::read_dir(&boundary.path)?.filter_map(|e| e.ok()) {
            let ft = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if ft.is_file() && !is_djafs_artifact(&entry.path()) {
                out.push(entry.path());
            }
        }
    }
    out.sort();
    Ok(out)
}

fn is_djafs_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("djfl") | Some("djfm") | Some("djfz")
    )
}

fn rel_slash(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
