//! Error types for the storage layer.

use btc_types::Sha256Hash;
use thiserror::Error;

/// Storage-specific errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A header or block arrived before its parent.
    #[error("Missing parent block: {0}")]
    MissingParent(Sha256Hash),

    /// Corruption detected.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Backend unavailable (connection lost, lock timeout, deadlock).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
