//! Sync error types.

use btc_network::RequestError;
use btc_storage::StorageError;
use btc_types::DecodeError;
use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A pending block payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A peer request failed.
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
