//! Bridges `vaultfs_fs::Filesystem`'s async API to `fuser::Filesystem`'s
//! synchronous, reply-callback one. Every callback blocks the calling FUSE
//! worker thread for the duration of one `Handle::block_on` future; this is
//! acceptable given this crate's single-mount/single-writer design.

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tracing::warn;
use vaultfs_core::VaultFsError;
use vaultfs_fs::{FsBlobKind, Stat};

const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

/// Adapts [`vaultfs_fs::Filesystem`]'s path-addressed API to FUSE's
/// inode-addressed one. Rename needs a path to move between inodes after
/// the fact, so this keeps a mutable bijection (`DashMap` both ways) rather
/// than an append-only interner.
pub struct VaultFuseFs {
    inner: Arc<vaultfs_fs::Filesystem>,
    handle: Handle,
    ino_to_path: DashMap<u64, String>,
    path_to_ino: DashMap<String, u64>,
    next_ino: AtomicU64,
    uid: u32,
    gid: u32,
}

impl VaultFuseFs {
    pub fn new(inner: Arc<vaultfs_fs::Filesystem>, handle: Handle, uid: u32, gid: u32) -> Self {
        let ino_to_path = DashMap::new();
        let path_to_ino = DashMap::new();
        ino_to_path.insert(ROOT_INO, "/".to_string());
        path_to_ino.insert("/".to_string(), ROOT_INO);
        Self {
            inner,
            handle,
            ino_to_path,
            path_to_ino,
            next_ino: AtomicU64::new(2),
            uid,
            gid,
        }
    }

    fn path_for_ino(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).map(|r| r.clone())
    }

    fn ino_for_path(&self, path: &str) -> u64 {
        if let Some(existing) = self.path_to_ino.get(path) {
            return *existing;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    fn forget_path(&self, path: &str) {
        if let Some((_, ino)) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    fn rename_path(&self, old: &str, new: &str) {
        if let Some((_, ino)) = self.path_to_ino.remove(old) {
            self.path_to_ino.insert(new.to_string(), ino);
            self.ino_to_path.insert(ino, new.to_string());
        }
    }

    fn child_path(parent: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    fn attr_from_stat(ino: u64, stat: Stat) -> FileAttr {
        let to_time = |t: vaultfs_fs::Timestamp| {
            UNIX_EPOCH
                .checked_add(Duration::new(t.secs.max(0) as u64, t.nanos))
                .unwrap_or(UNIX_EPOCH)
        };
        let kind = match stat.kind {
            FsBlobKind::Dir => FileType::Directory,
            FsBlobKind::File => FileType::RegularFile,
            FsBlobKind::Symlink => FileType::Symlink,
        };
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.size.div_ceil(512),
            atime: to_time(stat.atime),
            mtime: to_time(stat.mtime),
            ctime: to_time(stat.ctime),
            crtime: to_time(stat.ctime),
            kind,
            perm: stat.mode as u16,
            nlink: if stat.kind == FsBlobKind::Dir { 2 } else { 1 },
            uid: stat.uid,
            gid: stat.gid,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn to_errno(e: &VaultFsError) -> c_int {
        e.to_errno()
    }

    fn time_or_now_to_timestamp(t: TimeOrNow) -> vaultfs_fs::Timestamp {
        let system_time = match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => SystemTime::now(),
        };
        let d = system_time.duration_since(UNIX_EPOCH).unwrap_or_default();
        vaultfs_fs::Timestamp {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        }
    }
}

impl Filesystem for VaultFuseFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            return reply.error(libc::ENOENT);
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.handle.block_on(self.inner.stat(&child_path)) {
            Ok(stat) => {
                let ino = self.ino_for_path(&child_path);
                reply.entry(&TTL, &Self::attr_from_stat(ino, stat), 0)
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_for_ino(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.handle.block_on(self.inner.stat(&path)) {
            Ok(stat) => reply.attr(&TTL, &Self::attr_from_stat(ino, stat)),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            return reply.error(libc::ENOENT);
        };
        let result = self.handle.block_on(async {
            if let Some(mode) = mode {
                self.inner.chmod(&path, mode).await?;
            }
            if uid.is_some() || gid.is_some() {
                self.inner.chown(&path, uid, gid).await?;
            }
            if atime.is_some() || mtime.is_some() {
                self.inner
                    .utimens(
                        &path,
                        atime.map(Self::time_or_now_to_timestamp),
                        mtime.map(Self::time_or_now_to_timestamp),
                    )
                    .await?;
            }
            if let Some(size) = size {
                let owned_fd;
                let fd = match fh {
                    Some(fh) => fh,
                    None => {
                        owned_fd = self.inner.open(&path).await?;
                        owned_fd
                    }
                };
                let result = self.inner.truncate(fd, size).await;
                if fh.is_none() {
                    let _ = self.inner.close(fd);
                }
                result?;
            }
            self.inner.stat(&path).await
        });
        match result {
            Ok(stat) => reply.attr(&TTL, &Self::attr_from_stat(ino, stat)),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for_ino(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.handle.block_on(self.inner.readlink(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            return reply.error(libc::ENOENT);
        };
        let child_path = Self::child_path(&parent_path, name);
        let (uid, gid) = (self.uid, self.gid);
        let result = self.handle.block_on(async {
            self.inner.create_dir(&child_path, mode, uid, gid).await?;
            self.inner.stat(&child_path).await
        });
        match result {
            Ok(stat) => {
                let ino = self.ino_for_path(&child_path);
                reply.entry(&TTL, &Self::attr_from_stat(ino, stat), 0)
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            return reply.error(libc::ENOENT);
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.handle.block_on(self.inner.remove(&child_path)) {
            Ok(()) => {
                self.forget_path(&child_path);
                reply.ok();
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            return reply.error(libc::ENOENT);
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.handle.block_on(self.inner.rmdir(&child_path)) {
            Ok(()) => {
                self.forget_path(&child_path);
                reply.ok();
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            return reply.error(libc::ENOENT);
        };
        let child_path = Self::child_path(&parent_path, link_name);
        let target = target.to_string_lossy().into_owned();
        let (uid, gid) = (self.uid, self.gid);
        let result = self.handle.block_on(async {
            self.inner.create_symlink(&child_path, &target, uid, gid).await?;
            self.inner.stat(&child_path).await
        });
        match result {
            Ok(stat) => {
                let ino = self.ino_for_path(&child_path);
                reply.entry(&TTL, &Self::attr_from_stat(ino, stat), 0)
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(new_parent_path)) =
            (self.path_for_ino(parent), self.path_for_ino(newparent))
        else {
            return reply.error(libc::ENOENT);
        };
        let from = Self::child_path(&parent_path, name);
        let to = Self::child_path(&new_parent_path, newname);
        match self.handle.block_on(self.inner.rename(&from, &to)) {
            Ok(()) => {
                self.rename_path(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for_ino(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.handle.block_on(self.inner.open(&path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let mut buf = vec![0u8; size as usize];
        match self.handle.block_on(self.inner.read(fh, &mut buf, offset as u64)) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf);
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.handle.block_on(self.inner.write(fh, data, offset as u64)) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handle.block_on(self.inner.flush(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.inner.close(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.handle.block_on(self.inner.fsync(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            return reply.error(libc::ENOENT);
        };
        let child_path = Self::child_path(&parent_path, name);
        let (uid, gid) = (self.uid, self.gid);
        let result = self.handle.block_on(async {
            let fh = self.inner.create_and_open_file(&child_path, mode, uid, gid).await?;
            let stat = self.inner.stat(&child_path).await?;
            Ok::<_, VaultFsError>((fh, stat))
        });
        match result {
            Ok((fh, stat)) => {
                let ino = self.ino_for_path(&child_path);
                reply.created(&TTL, &Self::attr_from_stat(ino, stat), 0, fh, 0)
            }
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_for_ino(ino) else {
            return reply.error(libc::ENOENT);
        };
        let entries = match self.handle.block_on(self.inner.readdir(&path)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(Self::to_errno(&e)),
        };
        let parent_path = if path == "/" {
            "/".to_string()
        } else {
            match path.rsplit_once('/') {
                Some(("", _)) | None => "/".to_string(),
                Some((p, _)) => p.to_string(),
            }
        };

        for (i, e) in entries.into_iter().enumerate().skip(offset as usize) {
            let child_ino = match e.name.as_str() {
                "." => ino,
                ".." => self.ino_for_path(&parent_path),
                name => self.ino_for_path(&Self::child_path(&path, OsStr::new(name))),
            };
            let file_type = match e.kind {
                FsBlobKind::Dir => FileType::Directory,
                FsBlobKind::File => FileType::RegularFile,
                FsBlobKind::Symlink => FileType::Symlink,
            };
            if reply.add(child_ino, (i + 1) as i64, file_type, &e.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.handle.block_on(self.inner.statfs()) {
            Ok(s) => reply.statfs(
                s.num_total_blocks,
                s.num_free_blocks,
                s.num_available_blocks,
                s.num_total_inodes,
                s.num_free_inodes,
                s.block_size as u32,
                s.max_filename_length,
                s.block_size as u32,
            ),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_for_ino(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.handle.block_on(self.inner.access(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::to_errno(&e)),
        }
    }
}

pub fn mount(
    mountpoint: &Path,
    inner: Arc<vaultfs_fs::Filesystem>,
    handle: Handle,
    uid: u32,
    gid: u32,
    allow_root: bool,
    auto_unmount: bool,
) -> anyhow::Result<fuser::BackgroundSession> {
    let fs = VaultFuseFs::new(inner, handle, uid, gid);
    let mut options = vec![fuser::MountOption::FSName("vaultfs".to_string())];
    if allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }
    if auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    fuser::spawn_mount2(fs, mountpoint, &options).map_err(|e| {
        warn!("vaultfs_fuse: failed to mount at {}: {e}", mountpoint.display());
        e.into()
    })
}
