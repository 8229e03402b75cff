//! Transactions.

use crate::{double_sha256, Sha256Hash};
use bytes::Bytes;

/// A transaction carried as its raw serialized bytes.
///
/// Script and signature semantics belong to the block validator; the sync
/// core only needs identity (the hash) and the bytes to move around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    bytes: Bytes,
    hash: Sha256Hash,
}

impl Transaction {
    /// Wrap raw transaction bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let hash = double_sha256(&bytes);
        Self { bytes, hash }
    }

    /// Transaction hash (txid).
    pub fn hash(&self) -> Sha256Hash {
        self.hash
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Serialized size.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the transaction has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
