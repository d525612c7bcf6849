//! # djafs-hash
//!
//! Content hashing and content addressing for djafs.
//!
//! Every stored blob is named by a *target identifier* derived from the
//! SHA-256 of its bytes:
//!
//! ```text
//! B-SSSSS-H
//! │ │     └── lowercase hex SHA-256 of the file bytes
//! │ └── 5-digit zero-padded subbucket (spill index, 0 by default)
//! └── bucket: fnv1a64(H) mod 1000
//! ```
//!
//! The identifier is both the blob's filename inside an archive and its
//! path component inside the work area, so a blob's location is computable
//! from the identifier alone.

mod target;

pub use target::{
    archive_stem, bucket_of, parse_id, target_of, work_prefix, ParsedTarget, BUCKET_MODULUS,
};

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur while hashing or addressing content
#[derive(Error, Debug)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("expected file, got directory: {0}")]
    ExpectedFile(PathBuf),

    #[error("expected file, got symlink: {0}")]
    UnexpectedSymlink(PathBuf),

    #[error("invalid hash path: {0}")]
    InvalidHashPath(String),
}

pub type Result<T> = std::result::Result<T, HashError>;

/// Hash a stream of bytes, returning the lowercase hex SHA-256 digest.
pub fn hash_stream<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher))
}

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// Hash the contents of a regular file.
///
/// Directories fail with [`HashError::ExpectedFile`]; symlinks are rejected
/// with [`HashError::UnexpectedSymlink`] rather than followed.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Err(HashError::UnexpectedSymlink(path.to_path_buf()));
    }
    if meta.is_dir() {
        return Err(HashError::ExpectedFile(path.to_path_buf()));
    }
    let file = File::open(path)?;
    hash_stream(BufReader::new(file))
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // SHA-256 of the empty input, a fixed point of the algorithm.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(hash_bytes(b""), EMPTY_SHA256);
        assert_eq!(
            hash_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_stream_matches_bytes() {
        let data = b"some streamed content".to_vec();
        let streamed = hash_stream(&data[..]).unwrap();
        assert_eq!(streamed, hash_bytes(&data));
    }

    #[test]
    fn test_hash_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.json");
        std::fs::write(&path, b"{\"x\":1}").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"{\"x\":1}"));
    }

    #[test]
    fn test_hash_file_rejects_directory() {
        let temp = TempDir::new().unwrap();
        let result = hash_file(temp.path());
        assert!(matches!(result, Err(HashError::ExpectedFile(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_hash_file_rejects_symlink() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("real");
        std::fs::write(&target, b"data").unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let result = hash_file(&link);
        assert!(matches!(result, Err(HashError::UnexpectedSymlink(_))));
    }
}
