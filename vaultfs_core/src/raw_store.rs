//! L0 contract: a bag of fixed-size `(BlockId, bytes)` pairs.

use crate::{BlockId, VaultFsResult};
use async_trait::async_trait;

/// Rough free/total space estimate a raw store can offer for `statfs`.
/// Backends with no meaningful notion of disk space (e.g. an in-memory
/// store) leave a field `None`; callers treat that as "unknown / effectively
/// unlimited".
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreSizeEstimate {
    pub total_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
}

/// The L0 contract. Every block in a given store instance is exactly
/// `block_size()` bytes; implementations must reject (or pad then reject on
/// mismatch) anything else.
#[async_trait]
pub trait RawBlockStore: std::fmt::Debug + Send + Sync + 'static {
    /// Fixed physical size of every block in this store.
    fn block_size(&self) -> usize;

    /// Creates a new block. Fails with `AlreadyExists` if `id` is taken.
    async fn try_create(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<()>;

    /// Loads a block's raw bytes, or `None` if the id doesn't exist.
    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>>;

    /// Overwrites (or creates) a block unconditionally.
    async fn store(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<()>;

    /// Removes a block. Returns `Ok(())` whether or not it existed; callers
    /// that need to distinguish use `load` first.
    async fn remove(&self, id: BlockId) -> VaultFsResult<()>;

    /// Lists every block id currently in the store. Used by `fsck` and
    /// tests; not on any hot path.
    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>>;

    async fn num_blocks(&self) -> VaultFsResult<u64> {
        Ok(self.for_each_id().await?.len() as u64)
    }

    fn size_estimate(&self) -> StoreSizeEstimate {
        StoreSizeEstimate::default()
    }
}
