//! L0 raw block store backed by a directory of fixed-size files, fanned out
//! two levels deep by the block-id's leading hex byte so that no directory
//! ever holds more than ~2^24 entries for a typical filesystem.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use vaultfs_core::{BlockId, RawBlockStore, StoreSizeEstimate, VaultFsError, VaultFsResult};

#[derive(Debug)]
pub struct LocalBlockStore {
    base_path: PathBuf,
    block_size: usize,
}

impl LocalBlockStore {
    /// Opens (creating if needed) a local block store rooted at `base_path`.
    /// `block_size` is fixed for the lifetime of the store; every block
    /// written through it must be exactly that many bytes.
    pub async fn open(base_path: impl AsRef<Path>, block_size: usize) -> VaultFsResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            block_size,
        })
    }

    fn path_for(&self, id: BlockId) -> PathBuf {
        let (dir, file) = id.fan_out_path();
        self.base_path.join(dir).join(file)
    }

    fn check_size(&self, bytes: &[u8]) -> VaultFsResult<()> {
        if bytes.len() != self.block_size {
            return Err(VaultFsError::InvalidArgument(format!(
                "expected block of {} bytes, got {}",
                self.block_size,
                bytes.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RawBlockStore for LocalBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn try_create(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<()> {
        self.check_size(bytes)?;
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(bytes).await?;
                file.sync_all().await?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(VaultFsError::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
        let path = self.path_for(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<()> {
        self.check_size(bytes)?;
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file and rename, so a crash mid-write never
        // leaves a block that's neither the old nor the new content (spec
        // §4.1: "a block is either fully the new or fully the old content").
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
        let mut ids = Vec::new();
        let mut top = match fs::read_dir(&self.base_path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(sub) = top.next_entry().await? {
            if !sub.file_type().await?.is_dir() {
                continue;
            }
            let prefix = sub.file_name().to_string_lossy().to_string();
            let mut inner = fs::read_dir(sub.path()).await?;
            while let Some(entry) = inner.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let suffix = entry.file_name().to_string_lossy().to_string();
                match decode_hex_id(&prefix, &suffix) {
                    Some(id) => ids.push(id),
                    None => debug!("ignoring stray file in block store: {:?}", entry.path()),
                }
            }
        }
        Ok(ids)
    }

    fn size_estimate(&self) -> StoreSizeEstimate {
        match fs4::available_space(&self.base_path) {
            Ok(free) => {
                let total = fs4::total_space(&self.base_path).ok();
                StoreSizeEstimate {
                    total_bytes: total,
                    free_bytes: Some(free),
                }
            }
            Err(e) => {
                warn!("could not query free space for {:?}: {e}", self.base_path);
                StoreSizeEstimate::default()
            }
        }
    }
}

fn decode_hex_id(prefix: &str, suffix: &str) -> Option<BlockId> {
    if prefix.len() != 2 || suffix.len() != 30 {
        return None;
    }
    let hex = format!("{prefix}{suffix}");
    let mut bytes = [0u8; vaultfs_core::BLOCK_ID_LEN];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(BlockId::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_load_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlockStore::open(dir.path(), 8).await.unwrap();
        let id = BlockId::random();

        assert!(store.load(id).await.unwrap().is_none());
        store.try_create(id, b"abcdefgh").await.unwrap();
        assert_eq!(store.load(id).await.unwrap().unwrap(), b"abcdefgh");

        // Re-creating the same id is rejected.
        assert!(matches!(
            store.try_create(id, b"abcdefgh").await,
            Err(VaultFsError::AlreadyExists)
        ));

        store.store(id, b"ijklmnop").await.unwrap();
        assert_eq!(store.load(id).await.unwrap().unwrap(), b"ijklmnop");

        store.remove(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
        // Removing twice is a no-op, not an error.
        store.remove(id).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_wrong_size_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlockStore::open(dir.path(), 8).await.unwrap();
        let id = BlockId::random();
        assert!(matches!(
            store.try_create(id, b"short").await,
            Err(VaultFsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn for_each_id_lists_every_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlockStore::open(dir.path(), 4).await.unwrap();
        let mut ids = vec![BlockId::random(), BlockId::random(), BlockId::random()];
        ids.sort();
        for id in &ids {
            store.try_create(*id, b"abcd").await.unwrap();
        }
        let mut listed = store.for_each_id().await.unwrap();
        listed.sort();
        assert_eq!(listed, ids);
    }
}
