//! Error kinds with a defined disposition. Everything else travels as
//! `anyhow::Error` and aborts the current operation.

use thiserror::Error;

/// Errors produced by the storage facade.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The requested key does not exist. Surfaced to the caller as-is.
    #[error("key {0:?} not found")]
    NotFound(String),

    /// Blobs must never land in the object store unprotected.
    #[error("storage configuration requires compression or encryption")]
    CompressionOrEncryptionRequired,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A newer operation has taken over the op id; the running operation
/// observes this at its next check and terminates cooperatively.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation id mismatch - operation expired")]
pub struct ExpiredOperation;

/// Node side lease errors, mapped onto HTTP status codes by the API layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    /// 409 - locked by someone (lock), or not locked at all (relock/unlock).
    #[error("lease state conflict")]
    Conflict,
    /// 403 - locked, but by a different locker.
    #[error("lease held by someone else")]
    OwnerMismatch,
}
