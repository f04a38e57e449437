//! The shared "same shape as L0" contract that L1 and L2 both expose:
//! L1 transparently encrypts/decrypts, L2 wraps L1 and exposes the same
//! interface. Operates on the fixed-size plaintext *payload* this layer
//! hands to the layer above it, rather than on-disk bytes - every
//! implementor advertises the payload size it accepts via
//! [`PayloadBlockStore::payload_size`].

use async_trait::async_trait;
use vaultfs_core::{BlockId, VaultFsResult};

#[async_trait]
pub trait PayloadBlockStore: std::fmt::Debug + Send + Sync + 'static {
    /// Size in bytes of the plaintext payload this layer accepts from (and
    /// returns to) the layer above it. Constant for the store's lifetime.
    fn payload_size(&self) -> usize;

    async fn try_create(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()>;

    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>>;

    async fn store(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()>;

    async fn remove(&self, id: BlockId) -> VaultFsResult<()>;

    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>>;
}
