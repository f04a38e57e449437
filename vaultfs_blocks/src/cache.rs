//! L3: the write-back cache block store. Invariant: at most one live
//! handle per block id, and dirty entries are flushed before eviction,
//! LRU preferring clean entries first.
//!
//! Every public operation acquires a per-block-id [`Notify`]-backed lock
//! before touching the cache table, so two concurrent callers for the same
//! block id never race each other's read-modify-write. Entries are kept
//! in an LRU order; eviction always flushes a dirty entry to the inner
//! store first, and picks the least-recently-used *clean* entry before it
//! ever touches a dirty one, so a hot, frequently-dirtied block is not
//! repeatedly written back under load.

use crate::layer::PayloadBlockStore;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::warn;
use vaultfs_core::{BlockId, VaultFsResult};

struct CacheEntry {
    /// `None` once the block has been removed but the tombstone has not
    /// yet been flushed to the inner store.
    payload: Option<Vec<u8>>,
    dirty: bool,
}

struct CacheState {
    entries: HashMap<BlockId, CacheEntry>,
    /// Most-recently-used at the back.
    lru: VecDeque<BlockId>,
}

impl CacheState {
    fn touch(&mut self, id: BlockId) {
        self.lru.retain(|x| *x != id);
        self.lru.push_back(id);
    }
}

pub struct CacheBlockStore {
    inner: Arc<dyn PayloadBlockStore>,
    capacity: usize,
    state: Mutex<CacheState>,
    in_use: std::sync::Mutex<HashMap<BlockId, Arc<Notify>>>,
}

/// RAII guard proving exclusive access to one block id's cache entry for
/// the lifetime of an operation. Dropping it wakes the next waiter, if any.
struct IdGuard<'a> {
    store: &'a CacheBlockStore,
    id: BlockId,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        let mut in_use = self.store.in_use.lock().unwrap();
        if let Some(notify) = in_use.remove(&self.id) {
            notify.notify_waiters();
        }
    }
}

impl CacheBlockStore {
    pub fn new(inner: Arc<dyn PayloadBlockStore>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
            in_use: std::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, id: BlockId) -> IdGuard<'_> {
        loop {
            let notify = {
                let mut in_use = self.in_use.lock().unwrap();
                match in_use.get(&id) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        in_use.insert(id, Arc::new(Notify::new()));
                        None
                    }
                }
            };
            match notify {
                Some(notify) => notify.notified().await,
                None => return IdGuard { store: self, id },
            }
        }
    }

    /// Writes one dirty entry down to the inner store and clears its dirty
    /// bit. Caller must hold `state`.
    async fn flush_locked(&self, id: BlockId, entry: &mut CacheEntry) -> VaultFsResult<()> {
        if !entry.dirty {
            return Ok(());
        }
        match &entry.payload {
            Some(payload) => self.inner.store(id, payload).await?,
            None => self.inner.remove(id).await?,
        }
        entry.dirty = false;
        Ok(())
    }

    /// Evicts entries until the cache is back at capacity, flushing dirty
    /// victims first and preferring clean LRU victims over dirty ones.
    async fn evict_if_needed(&self, state: &mut CacheState) -> VaultFsResult<()> {
        while state.entries.len() > self.capacity {
            let victim = state
                .lru
                .iter()
                .find(|id| {
                    state
                        .entries
                        .get(*id)
                        .map(|e| !e.dirty)
                        .unwrap_or(false)
                })
                .copied()
                .or_else(|| state.lru.front().copied());
            let Some(victim) = victim else { break };
            if let Some(mut entry) = state.entries.remove(&victim) {
                self.flush_locked(victim, &mut entry).await?;
            }
            state.lru.retain(|x| *x != victim);
        }
        Ok(())
    }

    /// Flushes every dirty entry to the inner store without evicting them
    /// from the cache. Call before a clean shutdown or before listing ids,
    /// so the inner store reflects every acknowledged write.
    pub async fn flush_all(&self) -> VaultFsResult<()> {
        let mut state = self.state.lock().await;
        let ids: Vec<BlockId> = state.entries.keys().copied().collect();
        for id in ids {
            if let Some(mut entry) = state.entries.remove(&id) {
                let result = self.flush_locked(id, &mut entry).await;
                state.entries.insert(id, entry);
                result?;
            }
        }
        Ok(())
    }
}

impl Drop for CacheBlockStore {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            let dirty = state.entries.values().filter(|e| e.dirty).count();
            if dirty > 0 {
                warn!(dirty, "cache dropped with unflushed dirty entries; call flush_all().await before dropping");
            }
        }
    }
}

#[async_trait]
impl PayloadBlockStore for CacheBlockStore {
    fn payload_size(&self) -> usize {
        self.inner.payload_size()
    }

    // Creation must observe the inner store's existence check directly -
    // a cache can't honor "fail if it already exists" without asking the
    // backing store, so try_create always goes straight through.
    async fn try_create(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
        let _guard = self.acquire(id).await;
        self.inner.try_create(id, payload).await?;
        let mut state = self.state.lock().await;
        state.entries.insert(
            id,
            CacheEntry {
                payload: Some(payload.to_vec()),
                dirty: false,
            },
        );
        state.touch(id);
        self.evict_if_needed(&mut state).await
    }

    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
        let _guard = self.acquire(id).await;
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get(&id) {
            let payload = entry.payload.clone();
            state.touch(id);
            return Ok(payload);
        }
        drop(state);
        let loaded = self.inner.load(id).await?;
        let mut state = self.state.lock().await;
        state.entries.insert(
            id,
            CacheEntry {
                payload: loaded.clone(),
                dirty: false,
            },
        );
        state.touch(id);
        self.evict_if_needed(&mut state).await?;
        Ok(loaded)
    }

    async fn store(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
        let _guard = self.acquire(id).await;
        let mut state = self.state.lock().await;
        state.entries.insert(
            id,
            CacheEntry {
                payload: Some(payload.to_vec()),
                dirty: true,
            },
        );
        state.touch(id);
        self.evict_if_needed(&mut state).await
    }

    async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
        let _guard = self.acquire(id).await;
        let mut state = self.state.lock().await;
        state.entries.insert(
            id,
            CacheEntry {
                payload: None,
                dirty: true,
            },
        );
        state.touch(id);
        self.evict_if_needed(&mut state).await
    }

    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
        self.flush_all().await?;
        self.inner.for_each_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CryptBlockStore;
    use vaultfs_core::{Cipher, EncryptionKey};
    use vaultfs_store_memory::MemoryBlockStore;

    fn backing() -> (Arc<MemoryBlockStore>, Arc<dyn PayloadBlockStore>) {
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x33; Cipher::XChaCha20Poly1305.key_len()]);
        let crypt: Arc<dyn PayloadBlockStore> =
            Arc::new(CryptBlockStore::new(raw.clone(), Cipher::XChaCha20Poly1305, &key).unwrap());
        (raw, crypt)
    }

    #[tokio::test]
    async fn write_then_read_without_flush_returns_cached_copy() {
        let (_, inner) = backing();
        let cache = CacheBlockStore::new(inner, 8);
        let id = BlockId::random();
        let payload = vec![1u8; cache.payload_size()];
        cache.store(id, &payload).await.unwrap();
        assert_eq!(cache.load(id).await.unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn flush_all_writes_dirty_entries_through() {
        let (_, inner) = backing();
        let cache = CacheBlockStore::new(inner.clone(), 8);
        let id = BlockId::random();
        let payload = vec![2u8; cache.payload_size()];
        cache.store(id, &payload).await.unwrap();
        cache.flush_all().await.unwrap();
        assert_eq!(inner.load(id).await.unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn eviction_flushes_dirty_victim_before_dropping_it() {
        let (_, inner) = backing();
        let cache = CacheBlockStore::new(inner.clone(), 1);
        let a = BlockId::random();
        let b = BlockId::random();
        let payload_a = vec![3u8; cache.payload_size()];
        let payload_b = vec![4u8; cache.payload_size()];

        cache.store(a, &payload_a).await.unwrap();
        // Capacity is 1, so storing `b` evicts `a`, which must flush first.
        cache.store(b, &payload_b).await.unwrap();

        assert_eq!(inner.load(a).await.unwrap().unwrap(), payload_a);
    }

    #[tokio::test]
    async fn remove_defers_then_flushes_tombstone() {
        let (_, inner) = backing();
        let cache = CacheBlockStore::new(inner.clone(), 8);
        let id = BlockId::random();
        let payload = vec![5u8; cache.payload_size()];
        cache.try_create(id, &payload).await.unwrap();
        cache.remove(id).await.unwrap();
        assert_eq!(cache.load(id).await.unwrap(), None);
        cache.flush_all().await.unwrap();
        assert_eq!(inner.load(id).await.unwrap(), None);
    }
}
