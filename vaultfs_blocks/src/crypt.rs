//! L1: the encrypted block store.
//!
//! On-disk layout of one physical block:
//! `block_id(16) || format_version(2, LE) || nonce(cipher-specific) || ciphertext||tag`
//!
//! The block-id is bound into the AEAD associated data so an attacker who
//! copies a valid block's bytes into a different slot (relocation) gets
//! caught: decryption is attempted with `associated_data = the id the
//! caller requested`, which only matches the original ciphertext if nobody
//! moved it.

use crate::layer::PayloadBlockStore;
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use async_trait::async_trait;
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit, Payload, rand_core::RngCore};
use std::sync::Arc;
use vaultfs_core::{BlockId, Cipher, EncryptionKey, RawBlockStore, VaultFsError, VaultFsResult};

const FORMAT_VERSION: u16 = 1;
const ID_LEN: usize = vaultfs_core::BLOCK_ID_LEN;
const VERSION_LEN: usize = 2;

enum Aead0 {
    Aes256Gcm(Box<Aes256Gcm>),
    Aes128Gcm(Box<Aes128Gcm>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

impl Aead0 {
    fn new(cipher: Cipher, key: &EncryptionKey) -> VaultFsResult<Self> {
        let bytes = key.as_bytes();
        if bytes.len() != cipher.key_len() {
            return Err(VaultFsError::InvalidArgument(format!(
                "{} requires a {}-byte key, got {}",
                cipher.name(),
                cipher.key_len(),
                bytes.len()
            )));
        }
        Ok(match cipher {
            Cipher::Aes256Gcm => Aead0::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(bytes).map_err(
                |_| VaultFsError::InvalidArgument("invalid AES-256-GCM key".into()),
            )?)),
            Cipher::Aes128Gcm => Aead0::Aes128Gcm(Box::new(Aes128Gcm::new_from_slice(bytes).map_err(
                |_| VaultFsError::InvalidArgument("invalid AES-128-GCM key".into()),
            )?)),
            Cipher::XChaCha20Poly1305 => Aead0::XChaCha20Poly1305(Box::new(
                XChaCha20Poly1305::new_from_slice(bytes).map_err(|_| {
                    VaultFsError::InvalidArgument("invalid XChaCha20-Poly1305 key".into())
                })?,
            )),
            Cipher::Twofish256Gcm | Cipher::Serpent256Gcm => {
                return Err(VaultFsError::BadFormat(format!(
                    "{} is not implemented by this build",
                    cipher.name()
                )));
            }
        })
    }

    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> VaultFsResult<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let result = match self {
            Aead0::Aes256Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            Aead0::Aes128Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            Aead0::XChaCha20Poly1305(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
        };
        result.map_err(|_| VaultFsError::IntegrityViolation("AEAD encryption failed".into()))
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> VaultFsResult<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        let result = match self {
            Aead0::Aes256Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            Aead0::Aes128Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            Aead0::XChaCha20Poly1305(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
        };
        result.map_err(|_| {
            VaultFsError::IntegrityViolation("AEAD authentication failed (tampered block?)".into())
        })
    }
}

pub struct CryptBlockStore {
    raw: Arc<dyn RawBlockStore>,
    aead: Aead0,
    cipher: Cipher,
    payload_size: usize,
}

impl std::fmt::Debug for CryptBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptBlockStore")
            .field("cipher", &self.cipher.name())
            .field("payload_size", &self.payload_size)
            .finish()
    }
}

impl CryptBlockStore {
    pub fn new(
        raw: Arc<dyn RawBlockStore>,
        cipher: Cipher,
        key: &EncryptionKey,
    ) -> VaultFsResult<Self> {
        if !cipher.is_implemented() {
            return Err(VaultFsError::BadFormat(format!(
                "{} is not implemented by this build",
                cipher.name()
            )));
        }
        let overhead = ID_LEN + VERSION_LEN + cipher.nonce_len() + cipher.tag_len();
        let block_size = raw.block_size();
        let payload_size = block_size.checked_sub(overhead).ok_or_else(|| {
            VaultFsError::InvalidArgument(format!(
                "block size {block_size} too small for {} overhead ({overhead} bytes)",
                cipher.name()
            ))
        })?;
        let aead = Aead0::new(cipher, key)?;
        Ok(Self {
            raw,
            aead,
            cipher,
            payload_size,
        })
    }

    fn encode(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<Vec<u8>> {
        if payload.len() != self.payload_size {
            return Err(VaultFsError::InvalidArgument(format!(
                "expected payload of {} bytes, got {}",
                self.payload_size,
                payload.len()
            )));
        }
        let mut nonce = vec![0u8; self.cipher.nonce_len()];
        chacha20poly1305::aead::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self.aead.encrypt(&nonce, id.as_bytes(), payload)?;

        let mut out = Vec::with_capacity(self.raw.block_size());
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, id: BlockId, bytes: &[u8]) -> VaultFsResult<Vec<u8>> {
        let nonce_len = self.cipher.nonce_len();
        let header_len = ID_LEN + VERSION_LEN + nonce_len;
        if bytes.len() < header_len + self.cipher.tag_len() {
            return Err(VaultFsError::BadFormat("block shorter than header".into()));
        }
        let version = u16::from_le_bytes([bytes[ID_LEN], bytes[ID_LEN + 1]]);
        if version != FORMAT_VERSION {
            return Err(VaultFsError::BadFormat(format!(
                "unknown block format version {version}"
            )));
        }
        let nonce = &bytes[ID_LEN + VERSION_LEN..header_len];
        let ciphertext = &bytes[header_len..];
        // associated_data is the id the *caller* asked for, not the
        // plaintext prefix stored on disk - this is what catches relocation.
        self.aead.decrypt(nonce, id.as_bytes(), ciphertext)
    }
}

#[async_trait]
impl PayloadBlockStore for CryptBlockStore {
    fn payload_size(&self) -> usize {
        self.payload_size
    }

    async fn try_create(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
        let on_disk = self.encode(id, payload)?;
        self.raw.try_create(id, &on_disk).await
    }

    async fn load(&self, id: BlockId) -> VaultFsResult<Option<Vec<u8>>> {
        match self.raw.load(id).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(self.decode(id, &bytes)?)),
        }
    }

    async fn store(&self, id: BlockId, payload: &[u8]) -> VaultFsResult<()> {
        let on_disk = self.encode(id, payload)?;
        self.raw.store(id, &on_disk).await
    }

    async fn remove(&self, id: BlockId) -> VaultFsResult<()> {
        self.raw.remove(id).await
    }

    async fn for_each_id(&self) -> VaultFsResult<Vec<BlockId>> {
        self.raw.for_each_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultfs_store_memory::MemoryBlockStore;

    fn store(cipher: Cipher) -> CryptBlockStore {
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x42; cipher.key_len()]);
        CryptBlockStore::new(raw, cipher, &key).unwrap()
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip_all_ciphers() {
        for cipher in [Cipher::Aes256Gcm, Cipher::Aes128Gcm, Cipher::XChaCha20Poly1305] {
            let s = store(cipher);
            let id = BlockId::random();
            let payload = vec![7u8; s.payload_size()];
            s.try_create(id, &payload).await.unwrap();
            let got = s.load(id).await.unwrap().unwrap();
            assert_eq!(got, payload);
        }
    }

    #[tokio::test]
    async fn relocated_block_fails_to_decrypt() {
        let s = store(Cipher::XChaCha20Poly1305);
        let raw = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x42; Cipher::XChaCha20Poly1305.key_len()]);
        let s = CryptBlockStore::new(raw.clone(), Cipher::XChaCha20Poly1305, &key).unwrap();

        let a = BlockId::random();
        let b = BlockId::random();
        let payload = vec![9u8; s.payload_size()];
        s.try_create(a, &payload).await.unwrap();

        // Relocate the raw bytes from slot `a` to slot `b`.
        let raw_bytes = raw.load(a).await.unwrap().unwrap();
        raw.try_create(b, &raw_bytes).await.unwrap();

        assert!(matches!(
            s.load(b).await,
            Err(VaultFsError::IntegrityViolation(_))
        ));
        // The original slot is unaffected.
        assert_eq!(s.load(a).await.unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn wrong_key_size_is_rejected() {
        let raw: Arc<dyn RawBlockStore> = Arc::new(MemoryBlockStore::new(128));
        let key = EncryptionKey::new(vec![0x42; 5]);
        assert!(CryptBlockStore::new(raw, Cipher::Aes256Gcm, &key).is_err());
    }
}
