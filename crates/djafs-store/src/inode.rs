//! Process-wide inode counter and inode → virtual-path registry.
//!
//! The counter only moves forward: [`raise_inode_floor`] uses a
//! compare-and-swap loop so inodes recovered from logs at mount can never
//! lower it, and two successive [`mint_inode`] calls always return strictly
//! increasing values.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use walkdir::WalkDir;

use djafs_lookup::LookupLog;

use crate::layout::LOOKUP_FILE;
use crate::{Result, StoreError};

static HIGHEST_INODE: AtomicU64 = AtomicU64::new(0);
static REGISTRY: Lazy<RwLock<HashMap<u64, String>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Mint a fresh inode, strictly greater than every previously minted or
/// registered one.
pub fn mint_inode() -> u64 {
    HIGHEST_INODE.fetch_add(1, Ordering::SeqCst) + 1
}

/// Mint a fresh inode and record the virtual path it names.
pub fn mint_inode_for(name: &str) -> u64 {
    let inode = mint_inode();
    REGISTRY
        .write()
        .expect("inode registry poisoned")
        .insert(inode, name.to_string());
    inode
}

/// Raise the counter so the next minted inode exceeds `seen`. Never lowers.
pub fn raise_inode_floor(seen: u64) {
    let mut current = HIGHEST_INODE.load(Ordering::SeqCst);
    while seen > current {
        match HIGHEST_INODE.compare_exchange(
            current,
            seen,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Record an existing inode → path mapping and raise the floor past it.
pub fn register_inode(inode: u64, name: &str) {
    REGISTRY
        .write()
        .expect("inode registry poisoned")
        .insert(inode, name.to_string());
    raise_inode_floor(inode);
}

/// Drop an inode from the registry.
pub fn unregister_inode(inode: u64) {
    REGISTRY
        .write()
        .expect("inode registry poisoned")
        .remove(&inode);
}

/// Reverse lookup: the virtual path registered for `inode`.
pub fn name_for_inode(inode: u64) -> Result<String> {
    REGISTRY
        .read()
        .expect("inode registry poisoned")
        .get(&inode)
        .cloned()
        .ok_or(StoreError::InodeNotFound(inode))
}

/// Number of registered inodes.
pub fn registry_len() -> usize {
    REGISTRY.read().expect("inode registry poisoned").len()
}

/// Empty the registry. Test helper; the counter is left untouched.
pub fn clear_inode_registry() {
    REGISTRY.write().expect("inode registry poisoned").clear();
}

/// Scan every lookup log under `data_dir` and raise the inode floor to the
/// highest inode on record, so restarts never reuse one. Returns the floor.
pub fn restore_inode_floor(data_dir: &Path) -> Result<u64> {
    let mut highest = 0u64;
    for entry in WalkDir::new(data_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.file_name() != LOOKUP_FILE {
            continue;
        }
        let log = match LookupLog::load(entry.path()) {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable lookup log");
                continue;
            }
        };
        for rec in log.iter() {
            highest = highest.max(rec.inode);
        }
    }
    raise_inode_floor(highest);
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counter is process-global; these tests only assert relative
    // behavior so they stay order-independent.

    #[test]
    fn test_mint_is_strictly_increasing() {
        let a = mint_inode();
        let b = mint_inode();
        assert!(b > a);
    }

    #[test]
    fn test_raise_floor_never_lowers() {
        let current = mint_inode();
        raise_inode_floor(1);
        assert!(mint_inode() > current);
    }

    #[test]
    fn test_floor_skips_past_registered() {
        let base = mint_inode();
        register_inode(base + 100, "some/file.json");
        assert!(mint_inode() > base + 100);
        unregister_inode(base + 100);
    }

    #[test]
    fn test_registry_roundtrip() {
        let inode = mint_inode_for("a/b.json");
        assert_eq!(name_for_inode(inode).unwrap(), "a/b.json");
        unregister_inode(inode);
        assert!(matches!(
            name_for_inode(inode),
            Err(StoreError::InodeNotFound(_))
        ));
    }
}
