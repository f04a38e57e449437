//! L0 raw block store backed by an in-memory map. Used for tests, benches,
//! and as a demo backend with no durability guarantees.

use async_trait::async_trait;
use dashmap::DashMap;
use vaultfs_core::{BlockId, RawBlockStore, VaultFsError, VaultFsResult};

#[derive(Debug)]
pub struct MemoryBlockStore {
    blocks: DashMap<BlockId, Vec<u8>>,
    block_size: usize,
}

impl MemoryBlockStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: DashMap::new(),
            block_size,
        }
    }
}

#[async_trait]
impl RawBlockStore for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn try_create(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<()> {
        if bytes.len() != self.block_size {
            return Err(VaultFsError::InvalidArgument(format!(
                "expected block of {} bytes, got {}",
                self.block_size,
                bytes.len()
            )));
        }
        match self.blocks.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(VaultFsError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(bytes.to_vec());
                Ok(())
            }
        }
    }

    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
        Ok(self.blocks.get(&id).map(|v| v.clone()))
    }

    async fn store(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<()> {
        if bytes.len() != self.block_size {
            return Err(VaultFsError::InvalidArgument(format!(
                "expected block of {} bytes, got {}",
                self.block_size,
                bytes.len()
            )));
        }
        self.blocks.insert(id, bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
        self.blocks.remove(&id);
        Ok(())
    }

    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
        Ok(self.blocks.iter().map(|e| *e.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rejects_duplicate() {
        let store = MemoryBlockStore::new(4);
        let id = BlockId::random();
        store.try_create(id, b"abcd").await.unwrap();
        assert!(matches!(
            store.try_create(id, b"abcd").await,
            Err(VaultFsError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn store_overwrites() {
        let store = MemoryBlockStore::new(4);
        let id = BlockId::random();
        store.store(id, b"abcd").await.unwrap();
        store.store(id, b"wxyz").await.unwrap();
        assert_eq!(store.load(id).await.unwrap().unwrap(), b"wxyz");
    }
}
