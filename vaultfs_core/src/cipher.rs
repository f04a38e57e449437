//! AEAD cipher enumeration.

use serde::{Deserialize, Serialize};

/// Ciphers nameable in a config file. Only the three backed by a maintained
/// Rust AEAD crate in this workspace's dependency stack are actually usable
/// at mount time; the rest round-trip through config (de)serialization so an
/// old config file naming them doesn't fail to *parse*, but selecting one
/// fails fast with `BadFormat` rather than silently falling back to a
/// different cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cipher {
    Aes256Gcm,
    Aes128Gcm,
    XChaCha20Poly1305,
    Twofish256Gcm,
    Serpent256Gcm,
}

impl Cipher {
    /// Length in bytes of the nonce/IV this cipher expects.
    pub const fn nonce_len(self) -> usize {
        match self {
            Cipher::Aes256Gcm | Cipher::Aes128Gcm => 12,
            Cipher::XChaCha20Poly1305 => 24,
            Cipher::Twofish256Gcm | Cipher::Serpent256Gcm => 12,
        }
    }

    /// Length in bytes of the raw symmetric key this cipher expects.
    pub const fn key_len(self) -> usize {
        match self {
            Cipher::Aes128Gcm => 16,
            Cipher::Aes256Gcm | Cipher::XChaCha20Poly1305 => 32,
            Cipher::Twofish256Gcm | Cipher::Serpent256Gcm => 32,
        }
    }

    /// Length in bytes of the AEAD authentication tag this cipher appends.
    pub const fn tag_len(self) -> usize {
        16
    }

    /// Whether a usable implementation of this cipher is wired up in
    /// `vaultfs_blocks`. See DESIGN.md for the reasoning.
    pub const fn is_implemented(self) -> bool {
        matches!(
            self,
            Cipher::Aes256Gcm | Cipher::Aes128Gcm | Cipher::XChaCha20Poly1305
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Cipher::Aes256Gcm => "aes-256-gcm",
            Cipher::Aes128Gcm => "aes-128-gcm",
            Cipher::XChaCha20Poly1305 => "xchacha20-poly1305",
            Cipher::Twofish256Gcm => "twofish-256-gcm",
            Cipher::Serpent256Gcm => "serpent-256-gcm",
        }
    }
}
