//! # djafs-fuse
//!
//! FUSE binding for djafs. A thin adapter: every operation is translated
//! into a call on the [`djafs_fs::VirtualTree`] capability set, and every
//! [`djafs_fs::FsError`] into the nearest POSIX errno. The adapter owns
//! nothing but an inode <-> virtual-path table.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use chrono::{DateTime, Utc};
    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyWrite, Request, TimeOrNow,
    };
    use libc::{EIO, ENOENT, EPERM};
    use tracing::debug;

    use djafs_fs::{FsError, NodeAttr, NodeKind, SetAttr, VirtualTree};

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u32 = 4096;
    const ROOT_INO: u64 = 1;

    fn errno(e: &FsError) -> libc::c_int {
        match e {
            FsError::NotFound(_) => ENOENT,
            FsError::PermissionDenied(_) => EPERM,
            // ArchiveCorrupted and friends never reach the kernel as-is.
            _ => EIO,
        }
    }

    /// FUSE filesystem over a [`VirtualTree`].
    pub struct DjaFuse {
        tree: Arc<VirtualTree>,
        paths: HashMap<u64, String>,
        inodes: HashMap<String, u64>,
    }

    impl DjaFuse {
        pub fn new(tree: Arc<VirtualTree>) -> Self {
            let mut fs = Self {
                tree,
                paths: HashMap::new(),
                inodes: HashMap::new(),
            };
            fs.paths.insert(ROOT_INO, String::new());
            fs.inodes.insert(String::new(), ROOT_INO);
            fs
        }

        /// Serve the filesystem at `mountpoint` until unmounted.
        pub fn mount(self, mountpoint: &Path) -> std::io::Result<()> {
            let options = [
                MountOption::FSName("djafs".to_string()),
                MountOption::Subtype("djafs".to_string()),
                MountOption::DefaultPermissions,
            ];
            fuser::mount2(self, mountpoint, &options)
        }

        fn path_of(&self, ino: u64) -> Option<String> {
            self.paths.get(&ino).cloned()
        }

        /// Stable adapter inode for a virtual path; minted from the
        /// process-wide counter so it never collides with entry inodes.
        fn ino_for(&mut self, path: &str) -> u64 {
            if let Some(&ino) = self.inodes.get(path) {
                return ino;
            }
            let ino = djafs_store::mint_inode_for(path);
            self.inodes.insert(path.to_string(), ino);
            self.paths.insert(ino, path.to_string());
            ino
        }

        fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
            let name = name.to_str()?;
            let parent_path = self.path_of(parent)?;
            if parent_path.is_empty() {
                Some(name.to_string())
            } else {
                Some(format!("{}/{}", parent_path, name))
            }
        }

        fn file_attr(&mut self, path: &str, attr: &NodeAttr) -> FileAttr {
            let ino = if path.is_empty() {
                ROOT_INO
            } else {
                self.ino_for(path)
            };
            let mtime = to_system_time(attr.modified);
            FileAttr {
                ino,
                size: attr.size,
                blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
                atime: mtime,
                mtime,
                ctime: mtime,
                crtime: mtime,
                kind: match attr.kind {
                    NodeKind::Directory => FileType::Directory,
                    NodeKind::File => FileType::RegularFile,
                },
                perm: attr.mode as u16,
                nlink: if attr.kind == NodeKind::Directory { 2 } else { 1 },
                uid: unsafe { libc::getuid() },
                gid: unsafe { libc::getgid() },
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE,
            }
        }
    }

    fn to_system_time(ts: DateTime<Utc>) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(ts.timestamp().max(0) as u64)
    }

    fn from_time_or_now(t: TimeOrNow) -> DateTime<Utc> {
        match t {
            TimeOrNow::SpecificTime(st) => DateTime::<Utc>::from(st),
            TimeOrNow::Now => Utc::now(),
        }
    }

    impl Filesystem for DjaFuse {
        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let path = match self.child_path(parent, name) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.getattr(&path) {
                Ok(attr) => {
                    let fattr = self.file_attr(&path, &attr);
                    reply.entry(&TTL, &fattr, 0);
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.getattr(&path) {
                Ok(attr) => {
                    let fattr = self.file_attr(&path, &attr);
                    reply.attr(&TTL, &fattr);
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            let entries = match self.tree.readdir(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            };

            if offset == 0 {
                if reply.add(ino, 1, FileType::Directory, ".") {
                    reply.ok();
                    return;
                }
                if reply.add(ROOT_INO, 2, FileType::Directory, "..") {
                    reply.ok();
                    return;
                }
            }

            let skip = (offset - 2).max(0) as usize;
            for (i, entry) in entries.iter().enumerate().skip(skip) {
                let child = if path.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", path, entry.name)
                };
                let child_ino = self.ino_for(&child);
                let kind = match entry.kind {
                    NodeKind::Directory => FileType::Directory,
                    NodeKind::File => FileType::RegularFile,
                };
                if reply.add(child_ino, (i + 3) as i64, kind, &entry.name) {
                    break;
                }
            }
            reply.ok();
        }

        fn read(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.read(&path, offset.max(0) as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn write(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.write(&path, offset.max(0) as u64, data) {
                Ok(written) => reply.written(written as u32),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn create(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            flags: i32,
            reply: ReplyCreate,
        ) {
            let path = match self.child_path(parent, name) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.create(&path, mode) {
                Ok(attr) => {
                    let fattr = self.file_attr(&path, &attr);
                    debug!(path = %path, "created file");
                    reply.created(&TTL, &fattr, 0, 0, flags as u32);
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let path = match self.child_path(parent, name) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.mkdir(&path) {
                Ok(attr) => {
                    let fattr = self.file_attr(&path, &attr);
                    reply.entry(&TTL, &fattr, 0);
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let path = match self.child_path(parent, name) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.unlink(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn setattr(
            &mut self,
            _req: &Request,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            if size.is_none() && mtime.is_none() {
                match self.tree.getattr(&path) {
                    Ok(attr) => {
                        let fattr = self.file_attr(&path, &attr);
                        reply.attr(&TTL, &fattr);
                    }
                    Err(e) => reply.error(errno(&e)),
                }
                return;
            }
            let changes = SetAttr {
                size,
                mtime: mtime.map(from_time_or_now),
            };
            match self.tree.setattr(&path, changes) {
                Ok(attr) => {
                    let fattr = self.file_attr(&path, &attr);
                    reply.attr(&TTL, &fattr);
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn flush(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            _lock_owner: u64,
            reply: ReplyEmpty,
        ) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.fsync(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn fsync(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            _datasync: bool,
            reply: ReplyEmpty,
        ) {
            let path = match self.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.tree.fsync(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            }
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::path::Path;
    use std::sync::Arc;

    use djafs_fs::VirtualTree;

    /// Stub for non-Linux targets or builds without the `fuse` feature.
    pub struct DjaFuse;

    impl DjaFuse {
        pub fn new(_tree: Arc<VirtualTree>) -> Self {
            Self
        }

        pub fn mount(self, _mountpoint: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other(
                "FUSE support requires Linux and the `fuse` feature",
            ))
        }
    }
}

pub use imp::DjaFuse;
