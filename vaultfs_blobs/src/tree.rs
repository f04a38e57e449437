//! L4 blob store: variable-length byte sequences backed by a balanced
//! tree of fixed-size blocks.
//!
//! A blob's root block-id never changes over its lifetime, even as the
//! tree grows or shrinks: growing copies the current root's encoded bytes
//! into a freshly allocated block and rewrites the root block-id in place
//! to hold a new one-child inner node pointing at that copy; shrinking
//! runs the same trick in reverse. Everything above this module - FsBlob,
//! directories, the filesystem layer - can hold a blob's root id forever
//! without caring whether the tree underneath it has grown a level.

use crate::node::{Node, TreeGeometry};
use futures::future::BoxFuture;
use std::sync::Arc;
use vaultfs_blocks::PayloadBlockStore;
use vaultfs_core::{BlockId, VaultFsError, VaultFsResult};

pub struct BlobStore {
    store: Arc<dyn PayloadBlockStore>,
    geometry: TreeGeometry,
}

impl BlobStore {
    pub fn new(store: Arc<dyn PayloadBlockStore>) -> VaultFsResult<Self> {
        let geometry = TreeGeometry::for_payload_size(store.payload_size())?;
        Ok(Self { store, geometry })
    }

    pub fn geometry(&self) -> TreeGeometry {
        self.geometry
    }

    /// Creates a new, empty (zero-length) blob and returns a handle to it.
    pub async fn create(&self) -> VaultFsResult<BlobHandle> {
        let id = BlockId::random();
        let leaf = Node::empty_leaf(&self.geometry);
        self.store.try_create(id, &leaf.encode(0, &self.geometry)).await?;
        Ok(BlobHandle {
            store: self.store.clone(),
            geometry: self.geometry,
            root_id: id,
            root_depth: 0,
            size: 0,
        })
    }

    /// Loads the blob rooted at `root_id`, or `None` if no block exists
    /// there.
    pub async fn load(&self, root_id: BlockId) -> VaultFsResult<Option<BlobHandle>> {
        let Some(bytes) = self.store.load(root_id).await? else {
            return Ok(None);
        };
        let (depth, _) = Node::decode(&bytes, &self.geometry)?;
        let size = compute_size(&self.store, &self.geometry, root_id, depth).await?;
        Ok(Some(BlobHandle {
            store: self.store.clone(),
            geometry: self.geometry,
            root_id,
            root_depth: depth,
            size,
        }))
    }

    /// Deletes every block reachable from `handle`'s root, including the
    /// root block itself.
    pub async fn remove(&self, handle: BlobHandle) -> VaultFsResult<()> {
        remove_subtree(&self.store, &self.geometry, handle.root_id, handle.root_depth).await
    }
}

pub struct BlobHandle {
    store: Arc<dyn PayloadBlockStore>,
    geometry: TreeGeometry,
    root_id: BlockId,
    root_depth: u8,
    size: u64,
}

impl BlobHandle {
    pub fn root_id(&self) -> BlockId {
        self.root_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flushing is the L3 cache's responsibility (every call below already
    /// issues a synchronous `store`/`remove` against it); this exists so
    /// callers that model blobs as having their own flush point have
    /// something to call.
    pub async fn flush(&self) -> VaultFsResult<()> {
        Ok(())
    }

    pub async fn read(&self, buf: &mut [u8], offset: u64) -> VaultFsResult<usize> {
        let avail = self.size.saturating_sub(offset);
        let n = (buf.len() as u64).min(avail) as usize;
        if n == 0 {
            return Ok(0);
        }
        let leaf_capacity = self.geometry.leaf_capacity as u64;
        let mut pos = offset;
        let end = offset + n as u64;
        while pos < end {
            let next_boundary = (pos / leaf_capacity + 1) * leaf_capacity;
            let chunk_end = end.min(next_boundary);
            let chunk_len = (chunk_end - pos) as usize;
            let dst = &mut buf[(pos - offset) as usize..(pos - offset) as usize + chunk_len];
            match leaf_for_offset(&self.store, &self.geometry, self.root_id, self.root_depth, pos).await? {
                Some((leaf_id, local_off)) => {
                    let bytes = self
                        .store
                        .load(leaf_id)
                        .await?
                        .ok_or_else(|| VaultFsError::BadFormat("tree leaf vanished mid-read".into()))?;
                    let (_, node) = Node::decode(&bytes, &self.geometry)?;
                    let Node::Leaf { data, .. } = node else {
                        return Err(VaultFsError::BadFormat("expected leaf at depth 0".into()));
                    };
                    let start = local_off as usize;
                    dst.copy_from_slice(&data[start..start + chunk_len]);
                }
                None => dst.fill(0),
            }
            pos = chunk_end;
        }
        Ok(n)
    }

    pub async fn write(&mut self, buf: &[u8], offset: u64) -> VaultFsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset + buf.len() as u64;
        self.ensure_capacity(end).await?;

        let leaf_capacity = self.geometry.leaf_capacity as u64;
        let mut pos = offset;
        while pos < end {
            let next_boundary = (pos / leaf_capacity + 1) * leaf_capacity;
            let chunk_end = end.min(next_boundary);
            let chunk_len = (chunk_end - pos) as usize;
            let chunk = &buf[(pos - offset) as usize..(pos - offset) as usize + chunk_len];
            write_into(&self.store, &self.geometry, self.root_id, self.root_depth, pos, chunk).await?;
            pos = chunk_end;
        }
        self.size = self.size.max(end);
        Ok(())
    }

    pub async fn resize(&mut self, new_size: u64) -> VaultFsResult<()> {
        use std::cmp::Ordering;
        match new_size.cmp(&self.size) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => {
                self.ensure_capacity(new_size).await?;
                self.size = new_size;
                Ok(())
            }
            Ordering::Less => {
                shrink_subtree(&self.store, &self.geometry, self.root_id, self.root_depth, new_size).await?;
                self.collapse_root().await?;
                self.size = new_size;
                Ok(())
            }
        }
    }

    async fn ensure_capacity(&mut self, needed: u64) -> VaultFsResult<()> {
        while self.geometry.capacity_at_depth(self.root_depth) < needed {
            self.grow_root().await?;
        }
        Ok(())
    }

    async fn grow_root(&mut self) -> VaultFsResult<()> {
        let bytes = self
            .store
            .load(self.root_id)
            .await?
            .ok_or_else(|| VaultFsError::BadFormat("blob root vanished".into()))?;
        let copy_id = BlockId::random();
        self.store.try_create(copy_id, &bytes).await?;
        let new_root = Node::Inner { children: vec![copy_id] };
        self.store
            .store(self.root_id, &new_root.encode(self.root_depth + 1, &self.geometry))
            .await?;
        self.root_depth += 1;
        Ok(())
    }

    /// After a shrink, collapses single-child inner roots (I4) until the
    /// root is either a leaf or an inner node with >= 2 children.
    async fn collapse_root(&mut self) -> VaultFsResult<()> {
        while self.root_depth > 0 {
            let bytes = self
                .store
                .load(self.root_id)
                .await?
                .ok_or_else(|| VaultFsError::BadFormat("blob root vanished".into()))?;
            let (_, node) = Node::decode(&bytes, &self.geometry)?;
            let Node::Inner { children } = node else {
                break;
            };
            if children.len() != 1 {
                break;
            }
            let only_child = children[0];
            let child_bytes = self
                .store
                .load(only_child)
                .await?
                .ok_or_else(|| VaultFsError::BadFormat("blob child vanished".into()))?;
            self.store.store(self.root_id, &child_bytes).await?;
            self.store.remove(only_child).await?;
            self.root_depth -= 1;
        }
        Ok(())
    }
}

fn leaf_for_offset<'a>(
    store: &'a Arc<dyn PayloadBlockStore>,
    geometry: &'a TreeGeometry,
    id: BlockId,
    depth: u8,
    offset: u64,
) -> BoxFuture<'a, VaultFsResult<Option<(BlockId, u64)>>> {
    Box::pin(async move {
        let Some(bytes) = store.load(id).await? else {
            return Ok(None);
        };
        let (_, node) = Node::decode(&bytes, geometry)?;
        match node {
            Node::Leaf { .. } => Ok(Some((id, offset))),
            Node::Inner { children } => {
                let child_capacity = geometry.capacity_at_depth(depth - 1);
                let idx = (offset / child_capacity) as usize;
                if idx >= children.len() || children[idx].is_zero() {
                    return Ok(None);
                }
                let local_off = offset % child_capacity;
                leaf_for_offset(store, geometry, children[idx], depth - 1, local_off).await
            }
        }
    })
}

fn write_into<'a>(
    store: &'a Arc<dyn PayloadBlockStore>,
    geometry: &'a TreeGeometry,
    id: BlockId,
    depth: u8,
    offset: u64,
    data: &'a [u8],
) -> BoxFuture<'a, VaultFsResult<()>> {
    Box::pin(async move {
        let bytes = store
            .load(id)
            .await?
            .ok_or_else(|| VaultFsError::BadFormat("tree node vanished mid-write".into()))?;
        let (_, node) = Node::decode(&bytes, geometry)?;
        match node {
            Node::Leaf { used, mut data: leaf_data } => {
                let start = offset as usize;
                let end = start + data.len();
                leaf_data[start..end].copy_from_slice(data);
                let new_used = used.max(end as u32);
                let encoded = Node::Leaf { used: new_used, data: leaf_data }.encode(0, geometry);
                store.store(id, &encoded).await
            }
            Node::Inner { mut children } => {
                let child_capacity = geometry.capacity_at_depth(depth - 1);
                let idx = (offset / child_capacity) as usize;
                let local_off = offset % child_capacity;
                while children.len() <= idx {
                    children.push(BlockId::ZERO);
                }
                if children[idx].is_zero() {
                    let new_id = BlockId::random();
                    let empty = if depth - 1 == 0 {
                        Node::empty_leaf(geometry)
                    } else {
                        Node::Inner { children: Vec::new() }
                    };
                    store.try_create(new_id, &empty.encode(depth - 1, geometry)).await?;
                    children[idx] = new_id;
                }
                let child_id = children[idx];
                write_into(store, geometry, child_id, depth - 1, local_off, data).await?;
                let encoded = Node::Inner { children }.encode(depth, geometry);
                store.store(id, &encoded).await
            }
        }
    })
}

fn compute_size<'a>(
    store: &'a Arc<dyn PayloadBlockStore>,
    geometry: &'a TreeGeometry,
    id: BlockId,
    depth: u8,
) -> BoxFuture<'a, VaultFsResult<u64>> {
    Box::pin(async move {
        let bytes = store
            .load(id)
            .await?
            .ok_or_else(|| VaultFsError::BadFormat("blob node vanished while sizing".into()))?;
        let (_, node) = Node::decode(&bytes, geometry)?;
        match node {
            Node::Leaf { used, .. } => Ok(used as u64),
            Node::Inner { children } => {
                if children.is_empty() {
                    return Ok(0);
                }
                let full_children = children.len() as u64 - 1;
                let last = *children.last().unwrap();
                let last_size = if last.is_zero() {
                    0
                } else {
                    compute_size(store, geometry, last, depth - 1).await?
                };
                Ok(full_children * geometry.capacity_at_depth(depth - 1) + last_size)
            }
        }
    })
}

/// Shrinks the subtree rooted at `id` (at `depth`) so it covers at most
/// `keep_len` bytes, deleting any now-unreachable leaves/inner nodes.
fn shrink_subtree<'a>(
    store: &'a Arc<dyn PayloadBlockStore>,
    geometry: &'a TreeGeometry,
    id: BlockId,
    depth: u8,
    keep_len: u64,
) -> BoxFuture<'a, VaultFsResult<()>> {
    Box::pin(async move {
        let bytes = store
            .load(id)
            .await?
            .ok_or_else(|| VaultFsError::BadFormat("blob node vanished while shrinking".into()))?;
        let (_, node) = Node::decode(&bytes, geometry)?;
        match node {
            Node::Leaf { data, .. } => {
                let new_used = keep_len.min(geometry.leaf_capacity as u64) as u32;
                let mut data = data;
                for b in &mut data[new_used as usize..] {
                    *b = 0;
                }
                let encoded = Node::Leaf { used: new_used, data }.encode(0, geometry);
                store.store(id, &encoded).await
            }
            Node::Inner { mut children } => {
                let child_capacity = geometry.capacity_at_depth(depth - 1);
                let keep_children = if keep_len == 0 {
                    0
                } else {
                    (((keep_len - 1) / child_capacity) + 1) as usize
                }
                .max(1)
                .min(children.len());

                for child in children.drain(keep_children..) {
                    if !child.is_zero() {
                        remove_subtree(store, geometry, child, depth - 1).await?;
                    }
                }
                if let Some(last) = children.last().copied() {
                    let consumed_by_full_children = (keep_children as u64 - 1) * child_capacity;
                    let remaining = keep_len.saturating_sub(consumed_by_full_children);
                    if !last.is_zero() {
                        shrink_subtree(store, geometry, last, depth - 1, remaining).await?;
                    }
                }
                let encoded = Node::Inner { children }.encode(depth, geometry);
                store.store(id, &encoded).await
            }
        }
    })
}

fn remove_subtree<'a>(
    store: &'a Arc<dyn PayloadBlockStore>,
    geometry: &'a TreeGeometry,
    id: BlockId,
    depth: u8,
) -> BoxFuture<'a, VaultFsResult<()>> {
    Box::pin(async move {
        if depth > 0 {
            let bytes = store.load(id).await?;
            if let Some(bytes) = bytes {
                let (_, node) = Node::decode(&bytes, geometry)?;
                if let Node::Inner { children } = node {
                    for child in children {
                        if !child.is_zero() {
                            remove_subtree(store, geometry, child, depth - 1).await?;
                        }
                    }
                }
            }
        }
        store.remove(id).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultfs_store_memory::MemoryBlockStore;

    fn blob_store(payload_size: usize) -> BlobStore {
        let raw: Arc<dyn PayloadBlockStore> = Arc::new(TestPayloadStore::new(payload_size));
        BlobStore::new(raw).unwrap()
    }

    // A PayloadBlockStore directly over memory, bypassing crypto/integrity
    // so tree geometry math is exercised with tiny, test-friendly block sizes.
    #[derive(Debug)]
    struct TestPayloadStore {
        inner: MemoryBlockStore,
        payload_size: usize,
    }

    impl TestPayloadStore {
        fn new(payload_size: usize) -> Self {
            Self {
                inner: MemoryBlockStore::new(payload_size),
                payload_size,
            }
        }
    }

    #[async_trait::async_trait]
    impl PayloadBlockStore for TestPayloadStore {
        fn payload_size(&self) -> usize {
            self.payload_size
        }

        async fn try_create(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
            self.inner.try_create(id, payload).await
        }

        async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
            self.inner.load(id).await
        }

        async fn store(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
            self.inner.store(id, payload).await
        }

        async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
            self.inner.remove(id).await
        }

        async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
            self.inner.for_each_id().await
        }
    }

    #[tokio::test]
    async fn create_is_empty() {
        let bs = blob_store(64);
        let handle = bs.create().await.unwrap();
        assert_eq!(handle.size(), 0);
    }

    #[tokio::test]
    async fn small_write_read_roundtrip() {
        let bs = blob_store(64);
        let mut handle = bs.create().await.unwrap();
        handle.write(b"hello world", 0).await.unwrap();
        assert_eq!(handle.size(), 11);
        let mut buf = [0u8; 11];
        let n = handle.read(&mut buf, 0).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    // A write spanning many leaves forces the tree to grow beyond depth 0,
    // and truncate must then shrink it back down.
    #[tokio::test]
    async fn large_write_grows_tree_and_truncate_shrinks_it() {
        let payload_size = 5 + 16 * 4; // leaf_capacity = payload_size - 5 = 59, fanout = 3
        let bs = blob_store(payload_size);
        let mut handle = bs.create().await.unwrap();

        let leaf_capacity = bs.geometry().leaf_capacity as u64;
        let total_len = (leaf_capacity * 5) as usize; // forces depth >= 1
        let content: Vec<u8> = (0..total_len).map(|i| (i % 251) as u8).collect();
        handle.write(&content, 0).await.unwrap();
        assert_eq!(handle.size(), total_len as u64);
        assert!(handle.root_depth >= 1);

        let mut readback = vec![0u8; total_len];
        let n = handle.read(&mut readback, 0).await.unwrap();
        assert_eq!(n, total_len);
        assert_eq!(readback, content);

        handle.resize(1000.min(total_len as u64)).await.unwrap();
        assert_eq!(handle.size(), 1000.min(total_len as u64));
        let mut tail = vec![0u8; handle.size() as usize];
        handle.read(&mut tail, 0).await.unwrap();
        assert_eq!(tail, &content[..handle.size() as usize]);
    }

    #[tokio::test]
    async fn sparse_write_beyond_root_reads_as_zero_gap() {
        let payload_size = 5 + 16 * 4;
        let bs = blob_store(payload_size);
        let mut handle = bs.create().await.unwrap();
        let leaf_capacity = bs.geometry().leaf_capacity as u64;
        // Write far out, past several unfilled leaves.
        let offset = leaf_capacity * 4;
        handle.write(b"tail", offset).await.unwrap();

        let mut gap = vec![0xFFu8; leaf_capacity as usize];
        handle.read(&mut gap, 0).await.unwrap();
        assert!(gap.iter().all(|&b| b == 0));

        let mut tail = [0u8; 4];
        handle.read(&mut tail, offset).await.unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[tokio::test]
    async fn remove_deletes_every_reachable_block() {
        let payload_size = 5 + 16 * 4;
        let bs = blob_store(payload_size);
        let mut handle = bs.create().await.unwrap();
        let leaf_capacity = bs.geometry().leaf_capacity as u64;
        let content = vec![1u8; (leaf_capacity * 4) as usize];
        handle.write(&content, 0).await.unwrap();
        let root_id = handle.root_id();

        bs.remove(handle).await.unwrap();
        assert!(bs.load(root_id).await.unwrap().is_none());
    }
}
