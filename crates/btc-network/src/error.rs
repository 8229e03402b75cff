//! Network error types.

use crate::PeerId;
use btc_storage::StorageError;
use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Transport channel closed or refused the message.
    #[error("Send failed to {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The manager is shutting down.
    #[error("Connection manager is shutting down")]
    ShuttingDown,

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Why a correlated request did not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No active peer could serve the request.
    #[error("No peer available")]
    NoPeerAvailable,

    /// No reply arrived before the deadline.
    #[error("Request timed out")]
    Timeout,

    /// The peer disconnected while the request was outstanding.
    #[error("Peer disconnected")]
    PeerDisconnected,

    /// The peer does not have the requested data.
    #[error("Not found")]
    NotFound,

    /// The request could not be handed to the transport.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The reply did not match what was asked for.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<NetworkError> for RequestError {
    fn from(error: NetworkError) -> Self {
        RequestError::SendFailed(error.to_string())
    }
}
