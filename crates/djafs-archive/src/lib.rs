//! # djafs-archive
//!
//! The `.djfz` archive container: a single ZIP-format file holding exactly
//! one lookup log (`lookups.djfl`), at most one metadata record
//! (`metadata.djfm`), and any number of content blobs whose entry names are
//! their target identifiers.
//!
//! Blob bytes are stored as-is; the container's Deflate compression is what
//! shrinks the highly compressible JSON payloads djafs is built for.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use djafs_lookup::{LookupError, LookupLog, Metadata};

/// File extension for archive containers.
pub const ARCHIVE_EXT: &str = "djfz";
/// Entry name of the embedded lookup log.
pub const LOOKUP_NAME: &str = "lookups.djfl";
/// Entry name of the embedded metadata record.
pub const METADATA_NAME: &str = "metadata.djfm";

/// Errors that can occur while reading or writing archives
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("file path extension is not '.djfz': {0}")]
    NotArchiveExtension(PathBuf),

    #[error("archive is corrupted: {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("missing lookup table (lookups.djfl): {0}")]
    MissingLookup(PathBuf),

    #[error("blob {target} not found in archive {archive}")]
    BlobNotFound { archive: PathBuf, target: String },

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

fn check_extension(path: &Path) -> Result<()> {
    match path.extension() {
        Some(ext) if ext == ARCHIVE_EXT => Ok(()),
        _ => Err(ArchiveError::NotArchiveExtension(path.to_path_buf())),
    }
}

/// Read-side handle on an archive container.
pub struct Archive {
    path: PathBuf,
    zip: ZipArchive<BufReader<File>>,
}

impl Archive {
    /// Open an archive for reading. Fails with
    /// [`ArchiveError::NotArchiveExtension`] on the wrong filename and
    /// [`ArchiveError::Corrupted`] when the container cannot be parsed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_extension(&path)?;
        let file = File::open(&path)?;
        let zip = ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::Corrupted {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { path, zip })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the container, the embedded log and metadata
    /// included.
    pub fn count_entries(&self) -> usize {
        self.zip.len()
    }

    /// Names of every entry in the container.
    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(str::to_string).collect()
    }

    /// Whether the container holds an entry with this exact name.
    pub fn contains(&self, name: &str) -> bool {
        self.zip.file_names().any(|n| n == name)
    }

    /// Read the raw bytes of a blob entry.
    pub fn read_blob(&mut self, target: &str) -> Result<Vec<u8>> {
        let mut entry = match self.zip.by_name(target) {
            Ok(e) => e,
            Err(ZipError::FileNotFound) => {
                return Err(ArchiveError::BlobNotFound {
                    archive: self.path.clone(),
                    target: target.to_string(),
                })
            }
            Err(e) => {
                return Err(ArchiveError::Corrupted {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Extract and parse the embedded lookup log.
    pub fn lookup_log(&mut self) -> Result<LookupLog> {
        let entry = match self.zip.by_name(LOOKUP_NAME) {
            Ok(e) => e,
            Err(ZipError::FileNotFound) => {
                return Err(ArchiveError::MissingLookup(self.path.clone()))
            }
            Err(e) => {
                return Err(ArchiveError::Corrupted {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        LookupLog::from_reader(entry).map_err(|e| ArchiveError::Corrupted {
            path: self.path.clone(),
            reason: format!("failed to parse lookup table: {e}"),
        })
    }

    /// Extract and parse the embedded metadata record, if present.
    pub fn metadata(&mut self) -> Result<Option<Metadata>> {
        let entry = match self.zip.by_name(METADATA_NAME) {
            Ok(e) => e,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => {
                return Err(ArchiveError::Corrupted {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        let meta = Metadata::from_reader(entry).map_err(|e| ArchiveError::Corrupted {
            path: self.path.clone(),
            reason: format!("failed to parse metadata: {e}"),
        })?;
        Ok(Some(meta))
    }
}

/// Builder that writes a fresh archive container.
///
/// Entries are streamed straight into the ZIP writer; call
/// [`ArchiveWriter::finish`] to flush the central directory.
pub struct ArchiveWriter {
    path: PathBuf,
    zip: ZipWriter<File>,
}

impl ArchiveWriter {
    /// Create a new archive at `path`, truncating any existing file. The
    /// filename must carry the `.djfz` extension.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_extension(&path)?;
        Self::create_unchecked(path)
    }

    /// Create a writer without the `.djfz` extension check, for temp files
    /// that are renamed into place after [`ArchiveWriter::finish`].
    pub fn create_unchecked<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            zip: ZipWriter::new(file),
        })
    }

    fn options() -> FileOptions {
        FileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    fn start(&mut self, name: &str) -> Result<()> {
        self.zip
            .start_file(name, Self::options())
            .map_err(|e| ArchiveError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Add a blob entry from a reader.
    pub fn add_blob<R: Read>(&mut self, target: &str, mut reader: R) -> Result<()> {
        self.start(target)?;
        io::copy(&mut reader, &mut self.zip)?;
        Ok(())
    }

    /// Add a blob entry from a byte slice.
    pub fn add_blob_bytes(&mut self, target: &str, data: &[u8]) -> Result<()> {
        self.start(target)?;
        self.zip.write_all(data)?;
        Ok(())
    }

    /// Embed the lookup log as `lookups.djfl`.
    pub fn write_log(&mut self, log: &LookupLog) -> Result<()> {
        self.start(LOOKUP_NAME)?;
        log.to_writer(&mut self.zip)?;
        Ok(())
    }

    /// Embed the metadata record as `metadata.djfm`.
    pub fn write_metadata(&mut self, meta: &Metadata) -> Result<()> {
        self.start(METADATA_NAME)?;
        meta.to_writer(&mut self.zip)?;
        Ok(())
    }

    /// Flush the central directory and return the written path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.zip.finish().map_err(|e| ArchiveError::Corrupted {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use djafs_lookup::LookupEntry;
    use tempfile::TempDir;

    fn sample_log() -> LookupLog {
        let mut log = LookupLog::new();
        log.append(LookupEntry {
            size: 7,
            inode: 1,
            modified: Utc.timestamp_opt(1000, 0).unwrap(),
            name: "a.json".into(),
            target: "5-00000-abc123".into(),
        });
        log.sort();
        log
    }

    fn write_sample(path: &Path) {
        let mut log = sample_log();
        let meta = Metadata::from_log(&mut log, 0);
        let mut w = ArchiveWriter::create(path).unwrap();
        w.add_blob_bytes("5-00000-abc123", b"{\"x\":1}").unwrap();
        w.write_log(&log).unwrap();
        w.write_metadata(&meta).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        write_sample(&path);

        let mut archive = Archive::open(&path).unwrap();
        assert_eq!(archive.count_entries(), 3);
        assert!(archive.contains(LOOKUP_NAME));
        assert!(archive.contains(METADATA_NAME));

        let blob = archive.read_blob("5-00000-abc123").unwrap();
        assert_eq!(blob, b"{\"x\":1}");

        let log = archive.lookup_log().unwrap();
        assert_eq!(log.len(), 1);

        let meta = archive.metadata().unwrap().unwrap();
        assert_eq!(meta.total_file_count, 1);
    }

    #[test]
    fn test_rejects_wrong_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.zip");
        std::fs::write(&path, b"whatever").unwrap();
        assert!(matches!(
            Archive::open(&path),
            Err(ArchiveError::NotArchiveExtension(_))
        ));
    }

    #[test]
    fn test_missing_lookup() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bare.djfz");
        let mut w = ArchiveWriter::create(&path).unwrap();
        w.add_blob_bytes("1-00000-ff", b"data").unwrap();
        w.finish().unwrap();

        let mut archive = Archive::open(&path).unwrap();
        assert!(matches!(
            archive.lookup_log(),
            Err(ArchiveError::MissingLookup(_))
        ));
        assert!(archive.metadata().unwrap().is_none());
    }

    #[test]
    fn test_corrupted_container() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.djfz");
        std::fs::write(&path, b"this is not a zip file").unwrap();
        assert!(matches!(
            Archive::open(&path),
            Err(ArchiveError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_blob_not_found() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("files.djfz");
        write_sample(&path);

        let mut archive = Archive::open(&path).unwrap();
        assert!(matches!(
            archive.read_blob("9-00000-nope"),
            Err(ArchiveError::BlobNotFound { .. })
        ));
    }
}
