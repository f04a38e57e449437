//! The core-facing slice of the config file boundary contract.
//!
//! The full on-disk config file (passphrase KDF parameters, mountpoint,
//! etc.) is owned by an external CLI, outside the core. This struct
//! is what the core actually reads at mount and writes `root_blob_id` back
//! into on first mount.

use crate::{BlockId, Cipher};
use zeroize::Zeroize;

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        EncryptionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// The core reads these fields at mount and writes back `root_blob_id` on
/// first mount.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub cipher: Cipher,
    pub encryption_key: EncryptionKey,
    pub block_size_bytes: u32,
    pub root_blob_id: Option<BlockId>,
    pub filesystem_id: [u8; 16],
    pub format_version: u16,
}
