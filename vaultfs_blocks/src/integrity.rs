//! L2: the integrity block store.
//!
//! Wraps L1 and exposes the same interface. Every payload carries a small
//! version header (`client_id:4 || version:8`) that this layer strips
//! before handing data up to L3/L4, and re-derives on the way down. A
//! local [`KnownVersionsDb`] remembers, per block, the highest version any
//! client has ever claimed and the highest version any client has ever
//! deleted (its tombstone), so that a version regression - a stale block
//! replayed by an untrusted storage backend - is caught instead of
//! silently accepted.

use crate::known_versions::KnownVersionsDb;
use crate::layer::PayloadBlockStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use vaultfs_core::{BlockId, VaultFsError, VaultFsResult};

const CLIENT_ID_LEN: usize = 4;
const VERSION_LEN: usize = 8;
const HEADER_LEN: usize = CLIENT_ID_LEN + VERSION_LEN;

#[derive(Debug)]
pub struct IntegrityBlockStore {
    inner: Arc<dyn PayloadBlockStore>,
    db: Mutex<KnownVersionsDb>,
    client_id: u32,
    payload_size: usize,
    /// If true, integrity violations are logged but not rejected - an
    /// escape hatch for recovering a filesystem whose known-versions DB
    /// was lost or is stale.
    allow_integrity_violations: bool,
}

impl IntegrityBlockStore {
    pub fn new(
        inner: Arc<dyn PayloadBlockStore>,
        db: KnownVersionsDb,
        client_id: u32,
        allow_integrity_violations: bool,
    ) -> VaultFsResult<Self> {
        let payload_size = inner.payload_size().checked_sub(HEADER_LEN).ok_or_else(|| {
            VaultFsError::InvalidArgument(format!(
                "inner payload size {} too small for version header ({HEADER_LEN} bytes)",
                inner.payload_size()
            ))
        })?;
        Ok(Self {
            inner,
            db: Mutex::new(db),
            client_id,
            payload_size,
            allow_integrity_violations,
        })
    }

    /// Persists the known-versions DB to `path`. Safe to call at any point,
    /// e.g. periodically or on unmount; does not disturb the in-memory
    /// state.
    pub async fn save_known_versions_db(&self, path: impl AsRef<std::path::Path>) -> VaultFsResult<()> {
        self.db.lock().await.save_to(path).await
    }

    fn decode(bytes: &[u8]) -> (u32, u64, &[u8]) {
        let client_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let version = u64::from_le_bytes(bytes[4..HEADER_LEN].try_into().unwrap());
        (client_id, version, &bytes[HEADER_LEN..])
    }

    fn encode(client_id: u32, version: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&client_id.to_le_bytes());
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn checked_read(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<Vec<u8>> {
        if bytes.len() != self.inner.payload_size() {
            return Err(VaultFsError::BadFormat(
                "integrity header shorter than expected".into(),
            ));
        }
        let (client_id, version, payload) = Self::decode(bytes);
        let mut db = self.db.lock().await;

        // V1: a version at or below a known tombstone is a resurrected
        // (previously-deleted) block being replayed back into existence.
        if let Some(tombstone) = db.tombstone_version(id) {
            if version <= tombstone && !self.allow_integrity_violations {
                return Err(VaultFsError::IntegrityViolation(format!(
                    "block {id} was deleted at version {tombstone}, but a stale copy at version {version} was served"
                )));
            }
        }
        // V2: a version lower than the last one this client itself wrote is
        // a rollback - the storage backend served an older snapshot.
        if let Some(last) = db.last_version(client_id, id) {
            if version < last && !self.allow_integrity_violations {
                return Err(VaultFsError::IntegrityViolation(format!(
                    "block {id} rolled back for client {client_id}: saw version {last} before, now {version}"
                )));
            }
        }
        db.record_seen(client_id, id, version);
        Ok(payload.to_vec())
    }

    async fn next_version(&self, id: BlockId) -> u64 {
        let db = self.db.lock().await;
        db.max_seen_version(id) + 1
    }
}

#[async_trait]
impl PayloadBlockStore for IntegrityBlockStore {
    fn payload_size(&self) -> usize {
        self.payload_size
    }

    async fn try_create(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
        if payload.len() != self.payload_size {
            return Err(VaultFsError::InvalidArgument(format!(
                "expected payload of {} bytes, got {}",
                self.payload_size,
                payload.len()
            )));
        }
        let version = self.next_version(id).await;
        let on_disk = Self::encode(self.client_id, version, payload);
        self.inner.try_create(id, &on_disk).await?;
        let mut db = self.db.lock().await;
        db.record_seen(self.client_id, id, version);
        Ok(())
    }

    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
        match self.inner.load(id).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(self.checked_read(id, &bytes).await?)),
        }
    }

    async fn store(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
        if payload.len() != self.payload_size {
            return Err(VaultFsError::InvalidArgument(format!(
                "expected payload of {} bytes, got {}",
                self.payload_size,
                payload.len()
            )));
        }
        let version = self.next_version(id).await;
        let on_disk = Self::encode(self.client_id, version, payload);
        self.inner.store(id, &on_disk).await?;
        let mut db = self.db.lock().await;
        db.record_seen(self.client_id, id, version);
        Ok(())
    }

    async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
        let version = self.next_version(id).await;
        self.inner.remove(id).await?;
        let mut db = self.db.lock().await;
        db.record_tombstone(id, version);
        Ok(())
    }

    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
        self.inner.for_each_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CryptBlockStore;
    use vaultfs_core::{Cipher, EncryptionKey};
    use vaultfs_store_memory::MemoryBlockStore;

    fn store(client_id: u32, allow_violations: bool) -> IntegrityBlockStore {
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x11; Cipher::XChaCha20Poly1305.key_len()]);
        let crypt: Arc<dyn PayloadBlockStore> =
            Arc::new(CryptBlockStore::new(raw, Cipher::XChaCha20Poly1305, &key).unwrap());
        IntegrityBlockStore::new(crypt, KnownVersionsDb::new(), client_id, allow_violations).unwrap()
    }

    #[tokio::test]
    async fn roundtrip_preserves_payload() {
        let s = store(1, false);
        let id = BlockId::random();
        let payload = vec![5u8; s.payload_size()];
        s.try_create(id, &payload).await.unwrap();
        assert_eq!(s.load(id).await.unwrap().unwrap(), payload);
    }

    // Rollback of a previously-overwritten block must be detected, not
    // silently served.
    #[tokio::test]
    async fn detects_version_rollback() {
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x11; Cipher::XChaCha20Poly1305.key_len()]);
        let crypt: Arc<dyn PayloadBlockStore> =
            Arc::new(CryptBlockStore::new(raw.clone(), Cipher::XChaCha20Poly1305, &key).unwrap());
        let s = IntegrityBlockStore::new(crypt, KnownVersionsDb::new(), 1, false).unwrap();

        let id = BlockId::random();
        let payload_a = vec![1u8; s.payload_size()];
        let payload_b = vec![2u8; s.payload_size()];
        s.try_create(id, &payload_a).await.unwrap();
        let old_raw = raw.load(id).await.unwrap().unwrap();
        s.store(id, &payload_b).await.unwrap();

        // An attacker replays the old on-disk bytes (rollback to version 1).
        raw.store(id, &old_raw).await.unwrap();
        assert!(matches!(
            s.load(id).await,
            Err(VaultFsError::IntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn detects_resurrected_block_after_delete() {
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x11; Cipher::XChaCha20Poly1305.key_len()]);
        let crypt: Arc<dyn PayloadBlockStore> =
            Arc::new(CryptBlockStore::new(raw.clone(), Cipher::XChaCha20Poly1305, &key).unwrap());
        let s = IntegrityBlockStore::new(crypt, KnownVersionsDb::new(), 1, false).unwrap();

        let id = BlockId::random();
        let payload = vec![3u8; s.payload_size()];
        s.try_create(id, &payload).await.unwrap();
        let old_raw = raw.load(id).await.unwrap().unwrap();
        s.remove(id).await.unwrap();

        // An attacker resurrects the deleted block by replaying its bytes.
        raw.try_create(id, &old_raw).await.unwrap();
        assert!(matches!(
            s.load(id).await,
            Err(VaultFsError::IntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn allow_integrity_violations_degrades_to_warning_only() {
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x11; Cipher::XChaCha20Poly1305.key_len()]);
        let crypt: Arc<dyn PayloadBlockStore> =
            Arc::new(CryptBlockStore::new(raw.clone(), Cipher::XChaCha20Poly1305, &key).unwrap());
        let s = IntegrityBlockStore::new(crypt, KnownVersionsDb::new(), 1, true).unwrap();

        let id = BlockId::random();
        let payload_a = vec![1u8; s.payload_size()];
        let payload_b = vec![2u8; s.payload_size()];
        s.try_create(id, &payload_a).await.unwrap();
        let old_raw = raw.load(id).await.unwrap().unwrap();
        s.store(id, &payload_b).await.unwrap();
        raw.store(id, &old_raw).await.unwrap();

        assert_eq!(s.load(id).await.unwrap().unwrap(), payload_a);
    }
}
