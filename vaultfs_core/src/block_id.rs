//! 16-byte block identifiers.

use rand::RngCore;
use std::fmt;

pub const BLOCK_ID_LEN: usize = 16;

/// Opaque 16-byte identifier for a block. Generated uniformly at random;
/// never derived from content (that would leak duplicate-content info).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    pub const ZERO: BlockId = BlockId([0u8; BLOCK_ID_LEN]);

    /// Generates a fresh, uniformly random block id from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; BLOCK_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        BlockId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        BlockId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; BLOCK_ID_LEN]
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(BLOCK_ID_LEN * 2);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// Two-level hex fan-out used by the directory-backed L0 store:
    /// the first byte becomes a subdirectory, the remainder the filename.
    pub fn fan_out_path(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockId").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for BlockId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; BLOCK_ID_LEN]> for BlockId {
    fn from(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        BlockId(bytes)
    }
}

impl From<BlockId> for [u8; BLOCK_ID_LEN] {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        let a = BlockId::random();
        let b = BlockId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn fan_out_path_roundtrips_hex() {
        let id = BlockId::from_bytes([0xab; BLOCK_ID_LEN]);
        let (dir, rest) = id.fan_out_path();
        assert_eq!(format!("{dir}{rest}"), id.to_hex());
        assert_eq!(dir, "ab");
    }
}
