//! Decode error types.

use thiserror::Error;

/// Errors raised while decoding chain primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before the structure was complete.
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// Bytes left over after the structure was decoded.
    #[error("Trailing bytes after payload: {0}")]
    TrailingBytes(usize),

    /// Payload larger than allowed.
    #[error("Payload too large: {size} bytes, max {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// Malformed hex string.
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    /// Hash of the wrong length.
    #[error("Invalid hash length: {0}")]
    InvalidHashLength(usize),
}

impl From<hex::FromHexError> for DecodeError {
    fn from(err: hex::FromHexError) -> Self {
        DecodeError::InvalidHex(err.to_string())
    }
}

/// Result type for decoding.
pub type DecodeResult<T> = Result<T, DecodeError>;
