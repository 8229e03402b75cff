//! Test data generators.
//!
//! Blocks built here have valid merkle roots but no proof of work; the
//! synchronization core never checks it.

use btc_types::{genesis_block, Block, BlockHeader, Sha256Hash, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique transactions.
static TX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A transaction unique to `seed`.
pub fn test_transaction(seed: u64) -> Transaction {
    let mut bytes = vec![0x02, 0x00, 0x00, 0x00];
    bytes.extend_from_slice(&seed.to_le_bytes());
    bytes.resize(60, 0xAB);
    Transaction::from_bytes(bytes)
}

/// A transaction that has not been generated before in this process.
pub fn unique_transaction() -> Transaction {
    let counter = TX_COUNTER.fetch_add(1, Ordering::SeqCst);
    test_transaction(u64::MAX - counter)
}

/// A block on top of `parent` carrying `transactions`.
pub fn block_with_transactions(parent: &Block, transactions: Vec<Transaction>) -> Block {
    let header = BlockHeader {
        version: 1,
        previous_block_hash: parent.hash(),
        merkle_root: Sha256Hash::ZERO,
        timestamp: parent.header.timestamp + 600,
        difficulty_bits: 0x1d00ffff,
        nonce: 0,
    };
    let mut block = Block::new(header, transactions);
    block.header.merkle_root = block.calculate_merkle_root();
    block
}

/// A block on top of `parent` with `transaction_count` fresh transactions.
///
/// `tag` goes into the nonce, so siblings built with different tags differ.
pub fn child_block(parent: &Block, tag: u32, transaction_count: usize) -> Block {
    let transactions = (0..transaction_count.max(1))
        .map(|_| unique_transaction())
        .collect();
    let mut block = block_with_transactions(parent, transactions);
    block.header.nonce = tag;
    block
}

/// A block whose header does not commit to its transactions.
pub fn block_with_bad_merkle_root(parent: &Block, tag: u32) -> Block {
    let mut block = child_block(parent, tag, 2);
    block.header.merkle_root = Sha256Hash::ZERO;
    block
}

/// Genesis followed by `length` blocks; element `i` is at height `i`.
pub fn build_chain(length: usize) -> Vec<Block> {
    let mut chain = vec![genesis_block()];
    for height in 1..=length {
        let parent = &chain[height - 1];
        let block = child_block(parent, height as u32, 2);
        chain.push(block);
    }
    chain
}

/// Two siblings on top of `parent`, ordered by hash (lowest first).
pub fn sibling_pair(parent: &Block) -> (Block, Block) {
    let a = child_block(parent, 1_000, 1);
    let b = child_block(parent, 2_000, 1);
    if a.hash() < b.hash() {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_types::GENESIS_BLOCK_HASH;

    #[test]
    fn test_chain_links_and_merkle_roots() {
        let chain = build_chain(5);
        assert_eq!(chain[0].hash(), GENESIS_BLOCK_HASH);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].previous_block_hash(), pair[0].hash());
            assert!(pair[1].has_valid_merkle_root());
        }
    }

    #[test]
    fn test_siblings_are_ordered() {
        let chain = build_chain(1);
        let (low, high) = sibling_pair(&chain[1]);
        assert!(low.hash() < high.hash());
        assert_eq!(low.previous_block_hash(), high.previous_block_hash());
    }

    #[test]
    fn test_bad_merkle_root() {
        let chain = build_chain(1);
        assert!(!block_with_bad_merkle_root(&chain[1], 7).has_valid_merkle_root());
    }
}
