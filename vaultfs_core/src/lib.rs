//! Shared protocol types and traits for the vaultfs encrypted filesystem.
//!
//! This crate has no I/O of its own; it defines the vocabulary that every
//! other `vaultfs_*` crate builds on: block identifiers, the cipher and
//! atime-policy enumerations, the raw block store contract (L0), the config
//! boundary, and the error taxonomy.

pub mod atime;
pub mod cipher;
pub mod config;
pub mod error;
pub mod block_id;
pub mod raw_store;

pub use atime::AtimePolicy;
pub use block_id::{BLOCK_ID_LEN, BlockId};
pub use cipher::Cipher;
pub use config::{CoreConfig, EncryptionKey};
pub use error::{VaultFsError, VaultFsResult};
pub use raw_store::{RawBlockStore, StoreSizeEstimate};
