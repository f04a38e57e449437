//! FUSE frontend: adapts [`vaultfs_fs::Filesystem`] to `fuser::Filesystem`'s
//! inode-addressed, reply-callback API, bridging each synchronous callback
//! to the async core via a stored `tokio::runtime::Handle`.

mod fs;

pub use fs::{VaultFuseFs, mount};
