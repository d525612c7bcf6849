//! Virtual tree service.
//!
//! Presents the two top-level namespaces and implements the capability set
//! the FUSE binding consumes: `lookup`, `readdir`, `open`, `read`,
//! `write`, `truncate`, `create`, `mkdir`, `unlink`, `setattr`, `fsync`.
//!
//! Namespace semantics: directory listings and lookups consult the union
//! of lookup logs only, so a write becomes visible under `/live` after the
//! GC cycle that drains it. An open handle that is being written buffers
//! its own bytes, which keeps read-back working between `write` and
//! `fsync` without making the name visible early.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use djafs_config::Config;
use djafs_lookup::LookupLog;
use djafs_store::{HotCache, StoreLayout};

use crate::cache::LogCache;
use crate::content::load_entry_bytes;
use crate::resolve::{all_log_paths, live_entries, resolve_path};
use crate::snapshot::{list_snapshot_stamps, parse_snapshot_stamp, SnapshotStamp};
use crate::{FsError, Result};

/// Mode bits for regular files in the virtual tree.
pub const FILE_MODE: u32 = 0o644;
/// Mode bits for directories in the virtual tree.
pub const DIR_MODE: u32 = 0o755;

const ROOT_INODE: u64 = 1;
const LIVE_INODE: u64 = 2;
const SNAPSHOTS_INODE: u64 = 3;

/// Node kind in the virtual tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Attributes of a virtual node.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub inode: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub modified: DateTime<Utc>,
}

impl NodeAttr {
    fn dir(inode: u64, modified: DateTime<Utc>) -> Self {
        Self {
            inode,
            kind: NodeKind::Directory,
            size: 0,
            mode: DIR_MODE,
            modified,
        }
    }

    fn file(inode: u64, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            inode,
            kind: NodeKind::File,
            size,
            mode: FILE_MODE,
            modified,
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub inode: u64,
}

/// Attribute changes accepted by `setattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
}

/// Buffered state of an open, written-to file.
struct OpenFile {
    inode: u64,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    dirty: bool,
}

enum Node {
    Root,
    LiveRoot,
    SnapshotsRoot,
    Live(String),
    SnapshotRoot(SnapshotStamp),
    Snapshot(SnapshotStamp, String),
}

/// The service composing storage, resolution, and snapshots into the
/// mounted namespace.
pub struct VirtualTree {
    layout: StoreLayout,
    cache: LogCache,
    hot: Arc<HotCache>,
    open_writes: RwLock<HashMap<String, OpenFile>>,
}

impl VirtualTree {
    /// Open (or initialize) a storage root and restore the inode floor
    /// from its logs so restarts never reuse inodes.
    pub fn new(storage_root: &Path, config: &Config) -> Result<Self> {
        let layout = StoreLayout::new(storage_root);
        layout.init()?;
        let floor = djafs_store::restore_inode_floor(&layout.data_dir())?;
        debug!(floor, "restored inode floor from logs");
        let hot = Arc::new(HotCache::new(layout.clone(), config)?);
        Ok(Self {
            layout,
            cache: LogCache::new(),
            hot,
            open_writes: RwLock::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// The hot cache backing `/live` writes; hand this to a GC driver.
    pub fn hot_cache(&self) -> Arc<HotCache> {
        Arc::clone(&self.hot)
    }

    // ------------------------------------------------------------------
    // Capability set
    // ------------------------------------------------------------------

    /// Attributes of the filesystem root.
    pub fn root_lookup(&self) -> NodeAttr {
        NodeAttr::dir(ROOT_INODE, Utc::now())
    }

    /// Resolve a child of `parent` by name.
    pub fn lookup(&self, parent: &str, name: &str) -> Result<NodeAttr> {
        let joined = if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent.trim_end_matches('/'), name)
        };
        self.getattr(&joined)
    }

    /// Attributes of the node at a full virtual path.
    pub fn getattr(&self, path: &str) -> Result<NodeAttr> {
        match self.parse(path)? {
            Node::Root => Ok(NodeAttr::dir(ROOT_INODE, Utc::now())),
            Node::LiveRoot => Ok(NodeAttr::dir(LIVE_INODE, Utc::now())),
            Node::SnapshotsRoot => Ok(NodeAttr::dir(SNAPSHOTS_INODE, Utc::now())),
            Node::SnapshotRoot(_) => Ok(NodeAttr::dir(djafs_store::mint_inode(), Utc::now())),
            Node::Live(rel) => {
                if let Some(attr) = self.buffered_attr(&rel) {
                    return Ok(attr);
                }
                self.entry_or_dir_attr(&rel, None, path)
            }
            Node::Snapshot(stamp, rel) => self.entry_or_dir_attr(&rel, stamp.cutoff(), path),
        }
    }

    /// List a directory.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        match self.parse(path)? {
            Node::Root => Ok(vec![
                DirEntry {
                    name: "live".into(),
                    kind: NodeKind::Directory,
                    inode: LIVE_INODE,
                },
                DirEntry {
                    name: "snapshots".into(),
                    kind: NodeKind::Directory,
                    inode: SNAPSHOTS_INODE,
                },
            ]),
            Node::SnapshotsRoot => {
                let logs = self.load_all_logs()?;
                Ok(list_snapshot_stamps(logs.iter(), Utc::now())
                    .into_iter()
                    .map(|name| DirEntry {
                        name,
                        kind: NodeKind::Directory,
                        inode: djafs_store::mint_inode(),
                    })
                    .collect())
            }
            Node::LiveRoot => self.list_prefix("", None),
            Node::Live(rel) => self.list_prefix(&rel, None),
            Node::SnapshotRoot(stamp) => self.list_prefix("", stamp.cutoff()),
            Node::Snapshot(stamp, rel) => self.list_prefix(&rel, stamp.cutoff()),
        }
    }

    /// Open a file for reading; verifies existence and kind.
    pub fn open(&self, path: &str) -> Result<NodeAttr> {
        let attr = self.getattr(path)?;
        if attr.kind != NodeKind::File {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(attr)
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = match self.parse(path)? {
            Node::Live(rel) => {
                let buffered = {
                    let writes = self.open_writes.read().expect("open writes poisoned");
                    writes.get(&rel).map(|f| f.data.clone())
                };
                match buffered {
                    Some(data) => data,
                    None => self.load_resolved(&rel, None)?,
                }
            }
            Node::Snapshot(stamp, rel) => self.load_resolved(&rel, stamp.cutoff())?,
            _ => return Err(FsError::NotFound(path.to_string())),
        };

        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    /// Write bytes at `offset` into the open-file buffer for `path`.
    pub fn write(&self, path: &str, offset: u64, bytes: &[u8]) -> Result<usize> {
        let rel = self.live_rel(path)?;
        let mut writes = self.open_writes.write().expect("open writes poisoned");
        if !writes.contains_key(&rel) {
            let initial = self.load_resolved(&rel, None).unwrap_or_default();
            writes.insert(
                rel.clone(),
                OpenFile {
                    inode: djafs_store::mint_inode_for(&rel),
                    data: initial,
                    modified: Utc::now(),
                    dirty: false,
                },
            );
        }
        let file = writes.get_mut(&rel).expect("buffer just ensured");

        let end = offset as usize + bytes.len();
        if end > file.data.len() {
            file.data.resize(end, 0);
        }
        file.data[offset as usize..end].copy_from_slice(bytes);
        file.modified = Utc::now();
        file.dirty = true;
        Ok(bytes.len())
    }

    /// Truncate (or extend) the open-file buffer for `path`.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let rel = self.live_rel(path)?;
        let mut writes = self.open_writes.write().expect("open writes poisoned");
        if !writes.contains_key(&rel) {
            let initial = self.load_resolved(&rel, None).unwrap_or_default();
            writes.insert(
                rel.clone(),
                OpenFile {
                    inode: djafs_store::mint_inode_for(&rel),
                    data: initial,
                    modified: Utc::now(),
                    dirty: false,
                },
            );
        }
        let file = writes.get_mut(&rel).expect("buffer just ensured");
        file.data.resize(size as usize, 0);
        file.modified = Utc::now();
        file.dirty = true;
        Ok(())
    }

    /// Create an empty file under `/live`.
    pub fn create(&self, path: &str, _mode: u32) -> Result<NodeAttr> {
        let rel = self.live_rel(path)?;
        let mut writes = self.open_writes.write().expect("open writes poisoned");
        let inode = djafs_store::mint_inode_for(&rel);
        let now = Utc::now();
        writes.insert(
            rel,
            OpenFile {
                inode,
                data: Vec::new(),
                modified: now,
                dirty: true,
            },
        );
        Ok(NodeAttr::file(inode, 0, now))
    }

    /// Create a directory under `/live`. Directories are inferred from
    /// entry prefixes, so this only validates the namespace and hands back
    /// attributes.
    pub fn mkdir(&self, path: &str) -> Result<NodeAttr> {
        self.live_rel(path)?;
        Ok(NodeAttr::dir(djafs_store::mint_inode(), Utc::now()))
    }

    /// Delete a name under `/live` by appending a tombstone.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let rel = self.live_rel(path)?;

        let had_buffer = self
            .open_writes
            .write()
            .expect("open writes poisoned")
            .remove(&rel)
            .is_some();

        // An unflushed incoming copy must not resurrect the name next cycle.
        let incoming = self.layout.incoming_dir().join(&rel);
        let had_incoming = incoming.is_file() && std::fs::remove_file(&incoming).is_ok();

        let resolvable = resolve_path(&self.layout.data_dir(), &rel, &self.cache, None).is_ok();
        if resolvable {
            self.hot.delete_file(&rel)?;
        } else if !had_buffer && !had_incoming {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Apply size/mtime changes. The response attributes are computed from
    /// the buffer state already in hand, never by re-entering `getattr`.
    pub fn setattr(&self, path: &str, changes: SetAttr) -> Result<NodeAttr> {
        let rel = self.live_rel(path)?;
        let mut writes = self.open_writes.write().expect("open writes poisoned");
        if !writes.contains_key(&rel) {
            let initial = self
                .load_resolved(&rel, None)
                .map_err(|_| FsError::NotFound(path.to_string()))?;
            writes.insert(
                rel.clone(),
                OpenFile {
                    inode: djafs_store::mint_inode_for(&rel),
                    data: initial,
                    modified: Utc::now(),
                    dirty: false,
                },
            );
        }
        let file = writes.get_mut(&rel).expect("buffer just ensured");

        if let Some(size) = changes.size {
            file.data.resize(size as usize, 0);
            file.dirty = true;
            file.modified = Utc::now();
        }
        if let Some(mtime) = changes.mtime {
            file.modified = mtime;
        }
        Ok(NodeAttr::file(file.inode, file.data.len() as u64, file.modified))
    }

    /// Flush the open-file buffer for `path` into the hot cache. The name
    /// becomes visible under `/live` after the next GC cycle.
    pub fn fsync(&self, path: &str) -> Result<()> {
        let rel = self.live_rel(path)?;
        let flushed = {
            let mut writes = self.open_writes.write().expect("open writes poisoned");
            match writes.remove(&rel) {
                Some(file) if file.dirty => Some(file),
                Some(_) | None => None,
            }
        };
        if let Some(file) = flushed {
            self.hot.write_file(&rel, &file.data)?;
            debug!(path = %rel, bytes = file.data.len(), "flushed open file to hot cache");
        }
        Ok(())
    }

    /// Convenience for callers outside the FUSE binding: buffer and flush
    /// a whole file in one call.
    pub fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let rel = self.live_rel(path)?;
        self.hot.write_file(&rel, bytes)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn parse(&self, path: &str) -> Result<Node> {
        let clean = path.trim_matches('/');
        if clean.is_empty() {
            return Ok(Node::Root);
        }
        let (head, rest) = match clean.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (clean, None),
        };
        match (head, rest) {
            ("live", None) => Ok(Node::LiveRoot),
            ("live", Some(rel)) => Ok(Node::Live(rel.to_string())),
            ("snapshots", None) => Ok(Node::SnapshotsRoot),
            ("snapshots", Some(rest)) => {
                let (stamp_str, rel) = match rest.split_once('/') {
                    Some((stamp, rel)) => (stamp, Some(rel)),
                    None => (rest, None),
                };
                let stamp = parse_snapshot_stamp(stamp_str)
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                match rel {
                    None => Ok(Node::SnapshotRoot(stamp)),
                    Some(rel) => Ok(Node::Snapshot(stamp, rel.to_string())),
                }
            }
            _ => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// The live-relative portion of `path`, or PermissionDenied for write
    /// access outside `/live`.
    fn live_rel(&self, path: &str) -> Result<String> {
        match self.parse(path)? {
            Node::Live(rel) => Ok(rel),
            Node::Snapshot(..) | Node::SnapshotRoot(_) | Node::SnapshotsRoot => {
                Err(FsError::PermissionDenied(path.to_string()))
            }
            _ => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn buffered_attr(&self, rel: &str) -> Option<NodeAttr> {
        let writes = self.open_writes.read().expect("open writes poisoned");
        writes
            .get(rel)
            .map(|f| NodeAttr::file(f.inode, f.data.len() as u64, f.modified))
    }

    fn entry_or_dir_attr(
        &self,
        rel: &str,
        cutoff: Option<DateTime<Utc>>,
        path: &str,
    ) -> Result<NodeAttr> {
        match resolve_path(&self.layout.data_dir(), rel, &self.cache, cutoff) {
            Ok(resolved) => {
                djafs_store::register_inode(resolved.entry.inode, rel);
                Ok(NodeAttr::file(
                    resolved.entry.inode,
                    resolved.entry.size,
                    resolved.entry.modified,
                ))
            }
            Err(FsError::NotFound(_)) => {
                let live = live_entries(&self.layout.data_dir(), &self.cache, cutoff)?;
                let prefix = format!("{}/", rel);
                if live.keys().any(|name| name.starts_with(&prefix)) {
                    Ok(NodeAttr::dir(djafs_store::mint_inode(), Utc::now()))
                } else {
                    Err(FsError::NotFound(path.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn load_resolved(&self, rel: &str, cutoff: Option<DateTime<Utc>>) -> Result<Vec<u8>> {
        let resolved = resolve_path(&self.layout.data_dir(), rel, &self.cache, cutoff)?;
        load_entry_bytes(&self.layout, &resolved.archive_root, &resolved.entry.target)
    }

    fn list_prefix(&self, rel: &str, cutoff: Option<DateTime<Utc>>) -> Result<Vec<DirEntry>> {
        let live = live_entries(&self.layout.data_dir(), &self.cache, cutoff)?;
        let prefix = if rel.is_empty() {
            String::new()
        } else {
            format!("{}/", rel)
        };

        let mut files: BTreeMap<String, DirEntry> = BTreeMap::new();
        let mut dirs: BTreeMap<String, DirEntry> = BTreeMap::new();
        for (name, entry) in &live {
            let below = match name.strip_prefix(&prefix) {
                Some(below) if !below.is_empty() => below,
                _ => continue,
            };
            match below.split_once('/') {
                None => {
                    files.insert(
                        below.to_string(),
                        DirEntry {
                            name: below.to_string(),
                            kind: NodeKind::File,
                            inode: entry.inode,
                        },
                    );
                }
                Some((dir, _)) => {
                    dirs.entry(dir.to_string()).or_insert_with(|| DirEntry {
                        name: dir.to_string(),
                        kind: NodeKind::Directory,
                        inode: djafs_store::mint_inode(),
                    });
                }
            }
        }

        if files.is_empty() && dirs.is_empty() && !rel.is_empty() {
            // Distinguish an empty-but-real directory from a bogus path.
            return Err(FsError::NotFound(rel.to_string()));
        }
        let mut out: Vec<DirEntry> = dirs.into_values().collect();
        out.extend(files.into_values());
        Ok(out)
    }

    fn load_all_logs(&self) -> Result<Vec<LookupLog>> {
        let mut logs = Vec::new();
        for path in all_log_paths(&self.layout.data_dir()) {
            logs.push(self.cache.with_log(&path, |log| log.clone())?);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(temp: &TempDir) -> VirtualTree {
        VirtualTree::new(temp.path(), &Config::default()).unwrap()
    }

    fn gc(tree: &VirtualTree) {
        tree.hot_cache().run_gc_cycle().unwrap();
    }

    #[test]
    fn test_root_listing() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        let names: Vec<_> = t.readdir("").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["live", "snapshots"]);
    }

    #[test]
    fn test_write_visible_after_gc() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);

        t.write_file("live/a/b.json", b"{\"x\":1}").unwrap();
        assert!(matches!(
            t.getattr("live/a/b.json"),
            Err(FsError::NotFound(_))
        ));

        gc(&t);
        let attr = t.getattr("live/a/b.json").unwrap();
        assert_eq!(attr.kind, NodeKind::File);
        assert_eq!(attr.size, 7);
        assert_eq!(attr.mode, FILE_MODE);

        let data = t.read("live/a/b.json", 0, 1024).unwrap();
        assert_eq!(data, b"{\"x\":1}");
    }

    #[test]
    fn test_directory_inference_and_listing() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        t.write_file("live/a/b.json", b"1").unwrap();
        t.write_file("live/a/c/d.json", b"2").unwrap();
        gc(&t);

        let attr = t.getattr("live/a").unwrap();
        assert_eq!(attr.kind, NodeKind::Directory);
        assert_eq!(attr.mode, DIR_MODE);

        let entries = t.readdir("live/a").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["c", "b.json"]);
        assert_eq!(entries[0].kind, NodeKind::Directory);
        assert_eq!(entries[1].kind, NodeKind::File);
    }

    #[test]
    fn test_open_handle_buffer_reads_back_before_flush() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);

        t.create("live/fresh.json", FILE_MODE).unwrap();
        t.write("live/fresh.json", 0, b"hello").unwrap();
        assert_eq!(t.read("live/fresh.json", 0, 10).unwrap(), b"hello");

        t.fsync("live/fresh.json").unwrap();
        gc(&t);
        assert_eq!(t.read("live/fresh.json", 0, 10).unwrap(), b"hello");
    }

    #[test]
    fn test_writes_rejected_outside_live() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        assert!(matches!(
            t.write("snapshots/latest/x", 0, b"no"),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            t.create("snapshots/2024-01-01/x", FILE_MODE),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            t.unlink("snapshots/latest/x"),
            Err(FsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_unlink_then_latest_not_found() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        t.write_file("live/x", b"A").unwrap();
        gc(&t);

        t.unlink("live/x").unwrap();
        assert!(matches!(t.getattr("live/x"), Err(FsError::NotFound(_))));
        assert!(matches!(
            t.read("live/x", 0, 10),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_views_see_history() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);

        t.write_file("live/a/b.json", b"{\"x\":1}").unwrap();
        gc(&t);
        // Exact snapshot stamps have one-second granularity: keep the first
        // version, the cutoff, and the second version in distinct seconds.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let between = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        t.write_file("live/a/b.json", b"{\"x\":2}").unwrap();
        gc(&t);

        assert_eq!(t.read("live/a/b.json", 0, 64).unwrap(), b"{\"x\":2}");
        assert_eq!(
            t.read("snapshots/latest/a/b.json", 0, 64).unwrap(),
            b"{\"x\":2}"
        );

        let stamp = between.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let old = t
            .read(&format!("snapshots/{}/a/b.json", stamp), 0, 64)
            .unwrap();
        assert_eq!(old, b"{\"x\":1}");
    }

    #[test]
    fn test_snapshots_root_lists_stamps() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        t.write_file("live/x", b"data").unwrap();
        gc(&t);

        let names: Vec<_> = t
            .readdir("snapshots")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"latest".to_string()));
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(names.contains(&today));
    }

    #[test]
    fn test_setattr_truncates_and_reports() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        t.write_file("live/x", b"0123456789").unwrap();
        gc(&t);

        let attr = t
            .setattr(
                "live/x",
                SetAttr {
                    size: Some(4),
                    mtime: None,
                },
            )
            .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(t.read("live/x", 0, 64).unwrap(), b"0123");
    }

    #[test]
    fn test_bogus_snapshot_stamp_not_found() {
        let temp = TempDir::new().unwrap();
        let t = tree(&temp);
        assert!(matches!(
            t.getattr("snapshots/not-a-stamp/x"),
            Err(FsError::NotFound(_))
        ));
    }
}
