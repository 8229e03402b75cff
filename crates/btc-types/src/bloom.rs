//! Mempool bloom filters.

use bytes::Bytes;

/// A bloom filter summarizing the local mempool.
///
/// Construction belongs to the mempool; this side only carries the filter
/// to a peer alongside a thin block request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BloomFilter {
    /// Filter bit field.
    pub data: Bytes,
    /// Number of hash functions.
    pub hash_function_count: u32,
    /// Random tweak mixed into each hash function.
    pub tweak: u32,
}

impl BloomFilter {
    /// Create a filter from its parts.
    pub fn new(data: impl Into<Bytes>, hash_function_count: u32, tweak: u32) -> Self {
        Self {
            data: data.into(),
            hash_function_count,
            tweak,
        }
    }

    /// A filter matching nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the filter carries no bits.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
