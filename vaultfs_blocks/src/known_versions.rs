//! The known-versions database: a local, per-mount integrity witness.
//!
//! Binary layout: `magic(4) || format_version(2) || record_count(8) ||
//! records(client_id:4, block_id:16, last_version:8)* || tombstone_count(8)
//! || tombstones(block_id:16, version:8)*`. Atomically replaced on write via
//! write-to-temp-then-rename, the same pattern `vaultfs_store_local` uses
//! for block writes.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use vaultfs_core::{BlockId, VaultFsError, VaultFsResult};

const MAGIC: &[u8; 4] = b"VFKV";
const FORMAT_VERSION: u16 = 1;

/// (client_id, block_id) -> last seen version, plus the set of block-ids
/// known to have existed and a per-block tombstone floor.
#[derive(Debug, Default)]
pub struct KnownVersionsDb {
    versions: HashMap<(u32, BlockId), u64>,
    ever_existed: std::collections::HashSet<BlockId>,
    tombstones: HashMap<BlockId, u64>,
}

impl KnownVersionsDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_version(&self, client_id: u32, id: BlockId) -> Option<u64> {
        self.versions.get(&(client_id, id)).copied()
    }

    /// The highest version any client has ever claimed for `id`, used to
    /// compute this client's next version on write.
    pub fn max_seen_version(&self, id: BlockId) -> u64 {
        self.versions
            .iter()
            .filter(|((_, bid), _)| *bid == id)
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(0)
            .max(self.tombstones.get(&id).copied().unwrap_or(0))
    }

    pub fn record_seen(&mut self, client_id: u32, id: BlockId, version: u64) {
        self.versions.insert((client_id, id), version);
        self.ever_existed.insert(id);
    }

    pub fn has_ever_existed(&self, id: BlockId) -> bool {
        self.ever_existed.contains(&id)
    }

    pub fn tombstone_version(&self, id: BlockId) -> Option<u64> {
        self.tombstones.get(&id).copied()
    }

    pub fn record_tombstone(&mut self, id: BlockId, version: u64) {
        self.tombstones.insert(id, version);
        self.ever_existed.insert(id);
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u64_le(self.versions.len() as u64);
        for ((client_id, id), version) in &self.versions {
            buf.put_u32_le(*client_id);
            buf.put_slice(id.as_bytes());
            buf.put_u64_le(*version);
        }
        buf.put_u64_le(self.tombstones.len() as u64);
        for (id, version) in &self.tombstones {
            buf.put_slice(id.as_bytes());
            buf.put_u64_le(*version);
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> VaultFsResult<Self> {
        if bytes.len() < 4 + 2 + 8 || &bytes[0..4] != MAGIC {
            return Err(VaultFsError::BadFormat(
                "known-versions DB: bad magic".into(),
            ));
        }
        bytes.advance(4);
        let version = bytes.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(VaultFsError::BadFormat(format!(
                "known-versions DB: unsupported format version {version}"
            )));
        }
        let record_count = bytes.get_u64_le();
        let mut versions = HashMap::with_capacity(record_count as usize);
        let mut ever_existed = std::collections::HashSet::new();
        for _ in 0..record_count {
            if bytes.len() < 4 + 16 + 8 {
                return Err(VaultFsError::BadFormat(
                    "known-versions DB: truncated record".into(),
                ));
            }
            let client_id = bytes.get_u32_le();
            let id = read_block_id(&mut bytes);
            let last_version = bytes.get_u64_le();
            versions.insert((client_id, id), last_version);
            ever_existed.insert(id);
        }
        let tombstone_count = bytes.get_u64_le();
        let mut tombstones = HashMap::with_capacity(tombstone_count as usize);
        for _ in 0..tombstone_count {
            if bytes.len() < 16 + 8 {
                return Err(VaultFsError::BadFormat(
                    "known-versions DB: truncated tombstone".into(),
                ));
            }
            let id = read_block_id(&mut bytes);
            let v = bytes.get_u64_le();
            tombstones.insert(id, v);
            ever_existed.insert(id);
        }
        Ok(Self {
            versions,
            ever_existed,
            tombstones,
        })
    }

    pub async fn load_from(path: impl AsRef<Path>) -> VaultFsResult<Self> {
        match tokio::fs::read(path.as_ref()).await {
            Ok(bytes) => Self::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_to(&self, path: impl AsRef<Path>) -> VaultFsResult<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, self.encode()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

fn read_block_id(bytes: &mut &[u8]) -> BlockId {
    let mut raw = [0u8; vaultfs_core::BLOCK_ID_LEN];
    raw.copy_from_slice(&bytes[..vaultfs_core::BLOCK_ID_LEN]);
    bytes.advance(vaultfs_core::BLOCK_ID_LEN);
    BlockId::from_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut db = KnownVersionsDb::new();
        let a = BlockId::random();
        let b = BlockId::random();
        db.record_seen(1, a, 3);
        db.record_seen(2, a, 1);
        db.record_tombstone(b, 5);

        let decoded = KnownVersionsDb::decode(&db.encode()).unwrap();
        assert_eq!(decoded.last_version(1, a), Some(3));
        assert_eq!(decoded.last_version(2, a), Some(1));
        assert_eq!(decoded.tombstone_version(b), Some(5));
        assert!(decoded.has_ever_existed(a));
        assert!(decoded.has_ever_existed(b));
    }

    #[tokio::test]
    async fn save_load_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_versions.db");
        let mut db = KnownVersionsDb::new();
        let id = BlockId::random();
        db.record_seen(7, id, 42);
        db.save_to(&path).await.unwrap();

        let loaded = KnownVersionsDb::load_from(&path).await.unwrap();
        assert_eq!(loaded.last_version(7, id), Some(42));
    }

    #[tokio::test]
    async fn missing_db_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.db");
        let loaded = KnownVersionsDb::load_from(&path).await.unwrap();
        assert_eq!(loaded.last_version(1, BlockId::random()), None);
    }
}
