//! Encrypted, integrity-checked, write-back-cached block stack: L1
//! [`CryptBlockStore`] wraps an [`vaultfs_core::RawBlockStore`] (L0), L2
//! [`IntegrityBlockStore`] wraps that, and L3 [`CacheBlockStore`] sits on
//! top and is what L4 ([`vaultfs_blobs`](../vaultfs_blobs)) talks to.

mod cache;
mod crypt;
mod integrity;
mod known_versions;
mod layer;

pub use cache::CacheBlockStore;
pub use crypt::CryptBlockStore;
pub use integrity::IntegrityBlockStore;
pub use known_versions::KnownVersionsDb;
pub use layer::PayloadBlockStore;

use std::path::PathBuf;
use std::sync::Arc;
use vaultfs_core::{CoreConfig, RawBlockStore, VaultFsResult};

/// The assembled L1-L3 stack plus what's needed to persist the
/// known-versions DB on a clean shutdown. `vaultfs_fs` talks to `cache`
/// for every block operation and calls [`BlockStack::shutdown`] once,
/// on unmount.
pub struct BlockStack {
    pub cache: Arc<CacheBlockStore>,
    integrity: Arc<IntegrityBlockStore>,
    known_versions_path: PathBuf,
}

impl BlockStack {
    /// Builds the full L1-L3 stack from a raw block store and the mount's
    /// configuration, loading (or initializing) the known-versions DB from
    /// `known_versions_path`.
    pub async fn open(
        raw: Arc<dyn RawBlockStore>,
        config: &CoreConfig,
        client_id: u32,
        known_versions_path: impl Into<PathBuf>,
        cache_capacity: usize,
        allow_integrity_violations: bool,
    ) -> VaultFsResult<Self> {
        let known_versions_path = known_versions_path.into();
        let crypt: Arc<dyn PayloadBlockStore> = Arc::new(CryptBlockStore::new(
            raw,
            config.cipher,
            &config.encryption_key,
        )?);
        let db = KnownVersionsDb::load_from(&known_versions_path).await?;
        let integrity = Arc::new(IntegrityBlockStore::new(
            crypt,
            db,
            client_id,
            allow_integrity_violations,
        )?);
        let payload_layer: Arc<dyn PayloadBlockStore> = integrity.clone();
        let cache = Arc::new(CacheBlockStore::new(payload_layer, cache_capacity));
        Ok(Self {
            cache,
            integrity,
            known_versions_path,
        })
    }

    /// Flushes every dirty cache entry down to disk and persists the
    /// known-versions DB. Must be awaited before the process exits.
    pub async fn shutdown(&self) -> VaultFsResult<()> {
        self.cache.flush_all().await?;
        self.integrity
            .save_known_versions_db(&self.known_versions_path)
            .await
    }
}
