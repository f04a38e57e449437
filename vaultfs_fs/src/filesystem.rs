//! L7: path resolution, node operations, the rename protocol, the
//! open-file table, and `statfs`.

use crate::direntry::{DirEntryList, Timestamp};
use crate::fsblob::{FsBlob, FsBlobKind};
use crate::open_file::{FileDescriptor, OpenFileTable};
use std::sync::Arc;
use vaultfs_blobs::BlobStore;
use vaultfs_core::atime::should_update_atime;
use vaultfs_core::{AtimePolicy, BlockId, RawBlockStore, VaultFsError, VaultFsResult};

pub const MAX_FILENAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: FsBlobKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub max_filename_length: u32,
    pub block_size: u64,
    pub num_total_blocks: u64,
    pub num_free_blocks: u64,
    pub num_available_blocks: u64,
    pub num_total_inodes: u64,
    pub num_free_inodes: u64,
    pub num_available_inodes: u64,
}

pub struct DirEntryView {
    pub name: String,
    pub kind: FsBlobKind,
    pub child_id: BlockId,
}

/// Root directory entries use mode/uid/gid/timestamps because, per (D3),
/// the root has no entry of its own in any directory to carry them.
const ROOT_MODE: u32 = 0o755;

pub struct Filesystem {
    blob_store: BlobStore,
    raw_store: Arc<dyn RawBlockStore>,
    root_id: BlockId,
    atime_policy: AtimePolicy,
    open_files: OpenFileTable,
}

impl Filesystem {
    pub fn new(
        blob_store: BlobStore,
        raw_store: Arc<dyn RawBlockStore>,
        root_id: BlockId,
        atime_policy: AtimePolicy,
    ) -> Self {
        Self {
            blob_store,
            raw_store,
            root_id,
            atime_policy,
            open_files: OpenFileTable::new(),
        }
    }

    /// Creates a fresh, empty root directory FsBlob. Called once, at
    /// format time, when a mount's config has no `root_blob_id` yet.
    pub async fn create_root(blob_store: &BlobStore) -> VaultFsResult<BlockId> {
        let root = FsBlob::create(blob_store, FsBlobKind::Dir, BlockId::ZERO).await?;
        Ok(root.root_id())
    }

    pub fn root_id(&self) -> BlockId {
        self.root_id
    }

    // ---- path resolution -------------------------------------------------

    fn split_path(path: &str) -> Vec<&str> {
        path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect()
    }

    fn split_parent(path: &str) -> VaultFsResult<(String, String)> {
        let comps = Self::split_path(path);
        let name = comps
            .last()
            .ok_or_else(|| VaultFsError::InvalidArgument("path has no final component".into()))?
            .to_string();
        if name.len() > MAX_FILENAME_LENGTH {
            return Err(VaultFsError::InvalidArgument(format!(
                "name longer than {MAX_FILENAME_LENGTH} bytes"
            )));
        }
        let parent = format!("/{}", comps[..comps.len() - 1].join("/"));
        Ok((parent, name))
    }

    /// Walks from the root, following one entry per path component.
    /// Returns the resolved node's id, kind, and the id of its immediate
    /// parent directory (the root is its own parent, as `..` at `/`).
    async fn resolve_path(&self, path: &str) -> VaultFsResult<(BlockId, FsBlobKind, BlockId)> {
        let comps = Self::split_path(path);
        if comps.is_empty() {
            return Ok((self.root_id, FsBlobKind::Dir, self.root_id));
        }
        let mut current_id = self.root_id;
        let mut current_kind = FsBlobKind::Dir;
        let mut parent_id = self.root_id;
        for comp in &comps {
            if current_kind != FsBlobKind::Dir {
                return Err(VaultFsError::NotADirectory);
            }
            let entries = self.load_dir_entries_only(current_id).await?;
            let entry = entries.get_by_name(comp).ok_or(VaultFsError::NotFound)?;
            parent_id = current_id;
            current_id = entry.child_id;
            current_kind = entry.kind;
        }
        Ok((current_id, current_kind, parent_id))
    }

    async fn is_ancestor(&self, ancestor: BlockId, mut node: BlockId) -> VaultFsResult<bool> {
        loop {
            if node == ancestor {
                return Ok(true);
            }
            if node == self.root_id {
                return Ok(false);
            }
            let fsblob = FsBlob::load(&self.blob_store, node).await?.ok_or(VaultFsError::NotFound)?;
            let parent = fsblob.parent_id();
            if parent.is_zero() {
                return Ok(false);
            }
            node = parent;
        }
    }

    // ---- directory body helpers -------------------------------------------

    async fn load_dir(&self, id: BlockId) -> VaultFsResult<(FsBlob, DirEntryList)> {
        let fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::Dir).await?;
        let entries = DirEntryList::deserialize(&fsblob.read_all_body().await?)?;
        Ok((fsblob, entries))
    }

    async fn load_dir_entries_only(&self, id: BlockId) -> VaultFsResult<DirEntryList> {
        let fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::Dir).await?;
        DirEntryList::deserialize(&fsblob.read_all_body().await?)
    }

    async fn store_dir(&self, fsblob: &mut FsBlob, entries: &DirEntryList) -> VaultFsResult<()> {
        let bytes = entries.serialize();
        fsblob.resize_body(bytes.len() as u64).await?;
        fsblob.write_body(&bytes, 0).await
    }

    async fn remove_blob(&self, id: BlockId) -> VaultFsResult<()> {
        let fsblob = FsBlob::load(&self.blob_store, id).await?.ok_or(VaultFsError::NotFound)?;
        self.blob_store.remove(fsblob.into_blob()).await
    }

    async fn maybe_update_atime(&self, id: BlockId, is_dir: bool) -> VaultFsResult<()> {
        let fsblob = match FsBlob::load(&self.blob_store, id).await? {
            Some(f) => f,
            None => return Ok(()),
        };
        let parent_id = fsblob.parent_id();
        if parent_id.is_zero() {
            return Ok(());
        }
        let (mut parent_fsblob, mut entries) = self.load_dir(parent_id).await?;
        let Some(entry) = entries.get_by_id(id) else {
            return Ok(());
        };
        let now = Timestamp::now();
        if should_update_atime(self.atime_policy, is_dir, entry.atime.secs, entry.mtime.secs, now.secs) {
            entries.update_access_time(id, now)?;
            self.store_dir(&mut parent_fsblob, &entries).await?;
        }
        Ok(())
    }

    async fn touch_mtime(&self, id: BlockId) -> VaultFsResult<()> {
        let fsblob = match FsBlob::load(&self.blob_store, id).await? {
            Some(f) => f,
            None => return Ok(()),
        };
        let parent_id = fsblob.parent_id();
        if parent_id.is_zero() {
            return Ok(());
        }
        let (mut parent_fsblob, mut entries) = self.load_dir(parent_id).await?;
        if entries.get_by_id(id).is_some() {
            entries.update_modification_time(id)?;
            self.store_dir(&mut parent_fsblob, &entries).await?;
        }
        Ok(())
    }

    // ---- stat / metadata ---------------------------------------------------

    pub async fn stat(&self, path: &str) -> VaultFsResult<Stat> {
        let comps = Self::split_path(path);
        if comps.is_empty() {
            let now = Timestamp::now();
            return Ok(Stat {
                kind: FsBlobKind::Dir,
                size: 0,
                mode: ROOT_MODE,
                uid: 0,
                gid: 0,
                atime: now,
                mtime: now,
                ctime: now,
            });
        }
        let (parent_path, name) = Self::split_parent(path)?;
        let (parent_id, parent_kind, _) = self.resolve_path(&parent_path).await?;
        if parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let entries = self.load_dir_entries_only(parent_id).await?;
        let entry = entries.get_by_name(&name).ok_or(VaultFsError::NotFound)?;
        let fsblob = FsBlob::load_expecting(&self.blob_store, entry.child_id, entry.kind).await?;
        Ok(Stat {
            kind: entry.kind,
            size: fsblob.body_len(),
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
        })
    }

    async fn update_entry(&self, path: &str, f: impl FnOnce(&mut crate::direntry::DirEntry)) -> VaultFsResult<()> {
        let (parent_path, name) = Self::split_parent(path)?;
        let (parent_id, parent_kind, _) = self.resolve_path(&parent_path).await?;
        if parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let (mut parent_fsblob, mut entries) = self.load_dir(parent_id).await?;
        let entry = entries.get_mut_by_name(&name).ok_or(VaultFsError::NotFound)?;
        f(entry);
        self.store_dir(&mut parent_fsblob, &entries).await
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> VaultFsResult<()> {
        self.update_entry(path, |e| {
            e.mode = mode;
            e.ctime = Timestamp::now();
        })
        .await
    }

    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VaultFsResult<()> {
        self.update_entry(path, |e| {
            if let Some(uid) = uid {
                e.uid = uid;
            }
            if let Some(gid) = gid {
                e.gid = gid;
            }
            e.ctime = Timestamp::now();
        })
        .await
    }

    pub async fn utimens(&self, path: &str, atime: Option<Timestamp>, mtime: Option<Timestamp>) -> VaultFsResult<()> {
        self.update_entry(path, |e| {
            if let Some(atime) = atime {
                e.atime = atime;
            }
            if let Some(mtime) = mtime {
                e.mtime = mtime;
            }
            e.ctime = Timestamp::now();
        })
        .await
    }

    pub async fn access(&self, path: &str) -> VaultFsResult<()> {
        self.resolve_path(path).await.map(|_| ())
    }

    // ---- create / remove ---------------------------------------------------

    async fn create_node(
        &self,
        path: &str,
        kind: FsBlobKind,
        mode: u32,
        uid: u32,
        gid: u32,
        symlink_target: Option<&str>,
    ) -> VaultFsResult<BlockId> {
        let (parent_path, name) = Self::split_parent(path)?;
        let (parent_id, parent_kind, _) = self.resolve_path(&parent_path).await?;
        if parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let (mut parent_fsblob, mut entries) = self.load_dir(parent_id).await?;
        if entries.get_by_name(&name).is_some() {
            return Err(VaultFsError::AlreadyExists);
        }
        let mut new_fsblob = FsBlob::create(&self.blob_store, kind, parent_id).await?;
        if let Some(target) = symlink_target {
            new_fsblob.write_body(target.as_bytes(), 0).await?;
        }
        let new_id = new_fsblob.root_id();
        entries.add(name, kind, new_id, mode, uid, gid)?;
        self.store_dir(&mut parent_fsblob, &entries).await?;
        Ok(new_id)
    }

    pub async fn create_dir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> VaultFsResult<()> {
        self.create_node(path, FsBlobKind::Dir, mode, uid, gid, None).await.map(|_| ())
    }

    pub async fn create_file(&self, path: &str, mode: u32, uid: u32, gid: u32) -> VaultFsResult<()> {
        self.create_node(path, FsBlobKind::File, mode, uid, gid, None).await.map(|_| ())
    }

    pub async fn create_symlink(&self, path: &str, target: &str, uid: u32, gid: u32) -> VaultFsResult<()> {
        self.create_node(path, FsBlobKind::Symlink, 0o777, uid, gid, Some(target))
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, path: &str) -> VaultFsResult<()> {
        let (parent_path, name) = Self::split_parent(path)?;
        let (parent_id, parent_kind, _) = self.resolve_path(&parent_path).await?;
        if parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let (mut parent_fsblob, mut entries) = self.load_dir(parent_id).await?;
        let entry = entries.get_by_name(&name).ok_or(VaultFsError::NotFound)?;
        if entry.kind == FsBlobKind::Dir {
            return Err(VaultFsError::IsADirectory);
        }
        let child_id = entry.child_id;
        entries.remove_by_name(&name)?;
        self.store_dir(&mut parent_fsblob, &entries).await?;
        self.remove_blob(child_id).await
    }

    pub async fn rmdir(&self, path: &str) -> VaultFsResult<()> {
        if Self::split_path(path).is_empty() {
            return Err(VaultFsError::Busy("cannot remove the root directory".into()));
        }
        let (parent_path, name) = Self::split_parent(path)?;
        let (parent_id, parent_kind, _) = self.resolve_path(&parent_path).await?;
        if parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let (mut parent_fsblob, mut entries) = self.load_dir(parent_id).await?;
        let entry = entries.get_by_name(&name).ok_or(VaultFsError::NotFound)?;
        if entry.kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let child_id = entry.child_id;
        let child_entries = self.load_dir_entries_only(child_id).await?;
        if !child_entries.is_empty() {
            return Err(VaultFsError::NotEmpty);
        }
        entries.remove_by_name(&name)?;
        self.store_dir(&mut parent_fsblob, &entries).await?;
        self.remove_blob(child_id).await
    }

    // ---- rename -------------------------------------------------------------

    /// Rename from `from` to `to`.
    pub async fn rename(&self, from: &str, to: &str) -> VaultFsResult<()> {
        if Self::split_path(from).is_empty() || Self::split_path(to).is_empty() {
            return Err(VaultFsError::Busy("cannot rename the root directory".into()));
        }
        let (from_parent_path, from_name) = Self::split_parent(from)?;
        let (to_parent_path, to_name) = Self::split_parent(to)?;

        let (from_parent_id, from_parent_kind, _) = self.resolve_path(&from_parent_path).await?;
        if from_parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let (to_parent_id, to_parent_kind, _) = self.resolve_path(&to_parent_path).await?;
        if to_parent_kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }

        // Step 1: the same-parent case reuses a single loaded handle
        // instead of acquiring the same directory blob's cache entry twice,
        // which would deadlock under the cache's one-handle-per-id rule.
        let (mut from_parent_fsblob, mut from_entries) = self.load_dir(from_parent_id).await?;

        let from_entry = from_entries.get_by_name(&from_name).ok_or(VaultFsError::NotFound)?.clone();
        let moved_id = from_entry.child_id;

        // Step 2: reject moving a directory into its own subtree.
        if from_entry.kind == FsBlobKind::Dir && self.is_ancestor(moved_id, to_parent_id).await? {
            return Err(VaultFsError::InvalidArgument(
                "cannot move a directory into its own subtree".into(),
            ));
        }

        if from_parent_id == to_parent_id {
            if from_name == to_name {
                return Ok(());
            }
            let mut freed = None;
            from_entries.add_or_overwrite(
                to_name,
                from_entry.kind,
                moved_id,
                from_entry.mode,
                from_entry.uid,
                from_entry.gid,
                |id| freed = Some(id),
            )?;
            from_entries.remove_by_name(&from_name)?;
            from_entries.touch_ctime(moved_id)?;
            self.store_dir(&mut from_parent_fsblob, &from_entries).await?;
            if let Some(freed_id) = freed {
                self.remove_blob(freed_id).await?;
            }
            return Ok(());
        }

        // Steps 3-4: cross-directory move.
        let (mut to_parent_fsblob, mut to_entries) = self.load_dir(to_parent_id).await?;

        let mut freed = None;
        to_entries.add_or_overwrite(
            to_name,
            from_entry.kind,
            moved_id,
            from_entry.mode,
            from_entry.uid,
            from_entry.gid,
            |id| freed = Some(id),
        )?;
        from_entries.remove_by_name(&from_name)?;

        self.store_dir(&mut to_parent_fsblob, &to_entries).await?;
        self.store_dir(&mut from_parent_fsblob, &from_entries).await?;

        // Step 5: the parent changed, so update the moved blob's header.
        let mut moved_fsblob = FsBlob::load(&self.blob_store, moved_id).await?.ok_or(VaultFsError::NotFound)?;
        moved_fsblob.set_parent_pointer(to_parent_id).await?;

        if let Some(freed_id) = freed {
            self.remove_blob(freed_id).await?;
        }
        Ok(())
    }

    // ---- directories --------------------------------------------------------

    pub async fn readdir(&self, path: &str) -> VaultFsResult<Vec<DirEntryView>> {
        let (id, kind, parent_id) = self.resolve_path(path).await?;
        if kind != FsBlobKind::Dir {
            return Err(VaultFsError::NotADirectory);
        }
        let entries = self.load_dir_entries_only(id).await?;
        self.maybe_update_atime(id, true).await?;
        let mut out = vec![
            DirEntryView { name: ".".into(), kind: FsBlobKind::Dir, child_id: id },
            DirEntryView { name: "..".into(), kind: FsBlobKind::Dir, child_id: parent_id },
        ];
        out.extend(entries.list().iter().map(|e| DirEntryView {
            name: e.name.clone(),
            kind: e.kind,
            child_id: e.child_id,
        }));
        Ok(out)
    }

    // ---- symlinks -------------------------------------------------------------

    pub async fn readlink(&self, path: &str) -> VaultFsResult<String> {
        let (id, kind, _) = self.resolve_path(path).await?;
        if kind != FsBlobKind::Symlink {
            return Err(VaultFsError::InvalidArgument("not a symlink".into()));
        }
        let fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::Symlink).await?;
        let bytes = fsblob.read_all_body().await?;
        String::from_utf8(bytes).map_err(|_| VaultFsError::BadFormat("symlink target is not valid UTF-8".into()))
    }

    // ---- open files -------------------------------------------------------------

    pub async fn open(&self, path: &str) -> VaultFsResult<FileDescriptor> {
        let (id, kind, _) = self.resolve_path(path).await?;
        match kind {
            FsBlobKind::File => Ok(self.open_files.open(id)),
            FsBlobKind::Dir => Err(VaultFsError::IsADirectory),
            FsBlobKind::Symlink => Err(VaultFsError::InvalidArgument("cannot open a symlink directly".into())),
        }
    }

    pub async fn create_and_open_file(&self, path: &str, mode: u32, uid: u32, gid: u32) -> VaultFsResult<FileDescriptor> {
        let id = self.create_node(path, FsBlobKind::File, mode, uid, gid, None).await?;
        Ok(self.open_files.open(id))
    }

    pub async fn read(&self, fd: FileDescriptor, buf: &mut [u8], offset: u64) -> VaultFsResult<usize> {
        let id = self.open_files.blob_id_of(fd)?;
        let fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::File).await?;
        let n = fsblob.read_body(buf, offset).await?;
        self.maybe_update_atime(id, false).await?;
        Ok(n)
    }

    pub async fn write(&self, fd: FileDescriptor, buf: &[u8], offset: u64) -> VaultFsResult<()> {
        let id = self.open_files.blob_id_of(fd)?;
        let mut fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::File).await?;
        fsblob.write_body(buf, offset).await?;
        self.touch_mtime(id).await
    }

    pub async fn truncate(&self, fd: FileDescriptor, new_len: u64) -> VaultFsResult<()> {
        let id = self.open_files.blob_id_of(fd)?;
        let mut fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::File).await?;
        fsblob.resize_body(new_len).await?;
        self.touch_mtime(id).await
    }

    pub async fn flush(&self, fd: FileDescriptor) -> VaultFsResult<()> {
        let id = self.open_files.blob_id_of(fd)?;
        let fsblob = FsBlob::load_expecting(&self.blob_store, id, FsBlobKind::File).await?;
        fsblob.flush().await
    }

    pub async fn fsync(&self, fd: FileDescriptor) -> VaultFsResult<()> {
        self.flush(fd).await
    }

    pub async fn fdatasync(&self, fd: FileDescriptor) -> VaultFsResult<()> {
        self.flush(fd).await
    }

    pub fn close(&self, fd: FileDescriptor) -> VaultFsResult<()> {
        self.open_files.close(fd).map(|_| ())
    }

    // ---- statfs -------------------------------------------------------------

    pub async fn statfs(&self) -> VaultFsResult<StatFs> {
        let block_size = self.blob_store.geometry().leaf_capacity as u64;
        let estimate = self.raw_store.size_estimate();
        let physical_block_size = self.raw_store.block_size().max(1) as u64;
        let num_total_blocks = estimate.total_bytes.map(|b| b / physical_block_size).unwrap_or(0);
        let num_free_blocks = estimate.free_bytes.map(|b| b / physical_block_size).unwrap_or(0);
        Ok(StatFs {
            max_filename_length: MAX_FILENAME_LENGTH as u32,
            block_size,
            num_total_blocks,
            num_free_blocks,
            num_available_blocks: num_free_blocks,
            num_total_inodes: num_total_blocks,
            num_free_inodes: num_free_blocks,
            num_available_inodes: num_free_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultfs_blocks::PayloadBlockStore;
    use vaultfs_store_memory::MemoryBlockStore;

    #[derive(Debug)]
    struct RawAsPayload(MemoryBlockStore, usize);

    #[async_trait::async_trait]
    impl PayloadBlockStore for RawAsPayload {
        fn payload_size(&self) -> usize {
            self.1
        }
        async fn try_create(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
            self.0.try_create(id, payload).await
        }
        async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
            self.0.load(id).await
        }
        async fn store(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
            self.0.store(id, payload).await
        }
        async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
            self.0.remove(id).await
        }
        async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
            self.0.for_each_id().await
        }
    }

    async fn new_fs(atime_policy: AtimePolicy) -> Filesystem {
        let payload_size = 1024usize;
        let payload_store: Arc<dyn PayloadBlockStore> =
            Arc::new(RawAsPayload(MemoryBlockStore::new(payload_size), payload_size));
        let blob_store = BlobStore::new(payload_store).unwrap();
        let root_id = Filesystem::create_root(&blob_store).await.unwrap();
        let raw_store: Arc<dyn RawBlockStore> = Arc::new(MemoryBlockStore::new(payload_size));
        Filesystem::new(blob_store, raw_store, root_id, atime_policy)
    }

    // spec S1: create a file, write to it, read it back.
    #[tokio::test]
    async fn create_write_read_file() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_file("/hello.txt", 0o644, 1000, 1000).await.unwrap();
        let fd = fs.open("/hello.txt").await.unwrap();
        fs.write(fd, b"hello, world", 0).await.unwrap();

        let mut buf = [0u8; 12];
        let n = fs.read(fd, &mut buf, 0).await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf, b"hello, world");
        fs.close(fd).unwrap();

        let stat = fs.stat("/hello.txt").await.unwrap();
        assert_eq!(stat.kind, FsBlobKind::File);
        assert_eq!(stat.size, 12);
        assert_eq!(stat.mode, 0o644);
    }

    #[tokio::test]
    async fn create_existing_name_is_rejected() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_file("/a", 0o644, 0, 0).await.unwrap();
        assert!(matches!(
            fs.create_file("/a", 0o644, 0, 0).await,
            Err(VaultFsError::AlreadyExists)
        ));
    }

    // spec S3: directories, readdir yields "." and "..".
    #[tokio::test]
    async fn mkdir_and_readdir() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_dir("/sub", 0o755, 0, 0).await.unwrap();
        fs.create_file("/sub/f", 0o644, 0, 0).await.unwrap();

        let entries = fs.readdir("/sub").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"."));
        assert!(names.contains(&".."));
        assert!(names.contains(&"f"));
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn chmod_updates_mode() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_file("/a", 0o644, 0, 0).await.unwrap();
        fs.chmod("/a", 0o600).await.unwrap();
        assert_eq!(fs.stat("/a").await.unwrap().mode, 0o600);
    }

    // spec S4: symlinks.
    #[tokio::test]
    async fn symlink_create_and_readlink() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_symlink("/link", "/target/path", 0, 0).await.unwrap();
        assert_eq!(fs.readlink("/link").await.unwrap(), "/target/path");
        assert!(matches!(
            fs.readlink("/does-not-exist").await,
            Err(VaultFsError::NotFound)
        ));
    }

    // Same-directory rename preserves content and id.
    #[tokio::test]
    async fn rename_same_directory() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_file("/a", 0o644, 0, 0).await.unwrap();
        let fd = fs.open("/a").await.unwrap();
        fs.write(fd, b"data", 0).await.unwrap();
        fs.close(fd).unwrap();

        fs.rename("/a", "/b").await.unwrap();
        assert!(matches!(fs.stat("/a").await, Err(VaultFsError::NotFound)));
        let fd = fs.open("/b").await.unwrap();
        let mut buf = [0u8; 4];
        fs.read(fd, &mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    // Cross-directory rename updates the parent pointer.
    #[tokio::test]
    async fn rename_across_directories_updates_parent() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_dir("/src", 0o755, 0, 0).await.unwrap();
        fs.create_dir("/dst", 0o755, 0, 0).await.unwrap();
        fs.create_file("/src/f", 0o644, 0, 0).await.unwrap();

        fs.rename("/src/f", "/dst/f").await.unwrap();
        assert!(matches!(fs.stat("/src/f").await, Err(VaultFsError::NotFound)));
        assert!(fs.stat("/dst/f").await.is_ok());

        let dst_entries = fs.readdir("/dst").await.unwrap();
        let f_entry = dst_entries.iter().find(|e| e.name == "f").unwrap();
        let fsblob = FsBlob::load(&fs.blob_store, f_entry.child_id).await.unwrap().unwrap();
        let (dst_id, _, _) = fs.resolve_path("/dst").await.unwrap();
        assert_eq!(fsblob.parent_id(), dst_id);
    }

    #[tokio::test]
    async fn rename_directory_into_its_own_subtree_is_rejected() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_dir("/a", 0o755, 0, 0).await.unwrap();
        fs.create_dir("/a/b", 0o755, 0, 0).await.unwrap();
        assert!(matches!(
            fs.rename("/a", "/a/b/moved").await,
            Err(VaultFsError::InvalidArgument(_))
        ));
    }

    // rmdir refuses a non-empty directory.
    #[tokio::test]
    async fn rmdir_refuses_non_empty_and_succeeds_when_empty() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_dir("/d", 0o755, 0, 0).await.unwrap();
        fs.create_file("/d/f", 0o644, 0, 0).await.unwrap();
        assert!(matches!(fs.rmdir("/d").await, Err(VaultFsError::NotEmpty)));

        fs.remove("/d/f").await.unwrap();
        fs.rmdir("/d").await.unwrap();
        assert!(matches!(fs.stat("/d").await, Err(VaultFsError::NotFound)));
    }

    #[tokio::test]
    async fn remove_rejects_directories() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        fs.create_dir("/d", 0o755, 0, 0).await.unwrap();
        assert!(matches!(fs.remove("/d").await, Err(VaultFsError::IsADirectory)));
    }

    // NoAtime never updates atime on read.
    #[tokio::test]
    async fn noatime_policy_never_updates_atime() {
        let fs = new_fs(AtimePolicy::NoAtime).await;
        fs.create_file("/a", 0o644, 0, 0).await.unwrap();
        let before = fs.stat("/a").await.unwrap().atime;
        let fd = fs.open("/a").await.unwrap();
        let mut buf = [0u8; 1];
        let _ = fs.read(fd, &mut buf, 0).await;
        let after = fs.stat("/a").await.unwrap().atime;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn statfs_reports_leaf_capacity_as_block_size() {
        let fs = new_fs(AtimePolicy::Relatime).await;
        let stats = fs.statfs().await.unwrap();
        assert_eq!(stats.block_size, fs.blob_store.geometry().leaf_capacity as u64);
        assert_eq!(stats.max_filename_length, MAX_FILENAME_LENGTH as u32);
    }
}
