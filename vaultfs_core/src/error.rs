//! Crate-wide error taxonomy.
//!
//! One variant per outcome class: never mix e.g. a decode failure
//! and a not-found case under the same variant. Each layer maps its own
//! internal failures onto this taxonomy at the boundary where they're first
//! understood, and logs at that same point - not on every frame it bubbles
//! through.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultFsError {
    #[error("not found")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists")]
    AlreadyExists,

    #[error("unrecognized on-disk format: {0}")]
    BadFormat(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("operation not permitted on this node: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is out of space")]
    OutOfSpace,
}

pub type VaultFsResult<T> = std::result::Result<T, VaultFsError>;

impl VaultFsError {
    /// Maps the internal taxonomy onto a POSIX errno.
    /// Returned as a bare `i32` (the `libc::E*` value) so this crate doesn't
    /// need a dependency on `libc` just to name a handful of constants;
    /// `vaultfs_fuse` is the sole consumer and already depends on `libc`.
    pub fn to_errno(&self) -> i32 {
        match self {
            VaultFsError::NotFound => 2,       // ENOENT
            VaultFsError::Io(_) => 5,          // EIO
            VaultFsError::BadFormat(_) => 5,   // EIO
            VaultFsError::IntegrityViolation(_) => 5, // EIO
            VaultFsError::NotADirectory => 20, // ENOTDIR
            VaultFsError::AlreadyExists => 17, // EEXIST
            VaultFsError::InvalidArgument(_) => 22, // EINVAL
            VaultFsError::Busy(_) => 16,       // EBUSY
            VaultFsError::OutOfSpace => 28,    // ENOSPC
            VaultFsError::IsADirectory => 21,  // EISDIR
            VaultFsError::NotEmpty => 39,      // ENOTEMPTY
        }
    }
}
