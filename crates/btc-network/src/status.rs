//! Views of node state the network layer consults but does not own.

use btc_types::{BloomFilter, Sha256Hash, Transaction};

/// Whether the local chain has caught up with the best known header.
pub trait SynchronizationStatus: Send + Sync {
    fn is_blockchain_synchronized(&self) -> bool;
}

/// Read access to the local mempool.
pub trait MemoryPoolEnquirer: Send + Sync {
    /// Filter over the mempool, sent with a thin block request for `block_hash`.
    fn bloom_filter(&self, block_hash: &Sha256Hash) -> BloomFilter;

    /// Number of transactions in the mempool.
    fn transaction_count(&self) -> usize;

    /// Look up a mempool transaction.
    fn transaction(&self, hash: &Sha256Hash) -> Option<Transaction>;
}

/// A mempool that is always empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyMemoryPool;

impl MemoryPoolEnquirer for EmptyMemoryPool {
    fn bloom_filter(&self, _block_hash: &Sha256Hash) -> BloomFilter {
        BloomFilter::empty()
    }

    fn transaction_count(&self) -> usize {
        0
    }

    fn transaction(&self, _hash: &Sha256Hash) -> Option<Transaction> {
        None
    }
}
