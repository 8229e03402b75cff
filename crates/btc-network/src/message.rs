//! Decoded peer protocol messages.
//!
//! Byte-level encoding belongs to the socket layer. Everything here is
//! already parsed.

use btc_types::{
    Block, BlockHeader, BlockHeaderWithTransactionCount, BloomFilter, Sha256Hash, Transaction,
};

/// Maximum number of hashes carried by one `QueryBlocks` message.
pub const MAX_BLOCK_HASH_COUNT: usize = 500;

/// Ask a peer for the block hashes that follow the given ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBlocks {
    block_hashes: Vec<Sha256Hash>,
    stop_before: Option<Sha256Hash>,
}

impl QueryBlocks {
    /// Create an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a starting hash. Hashes beyond [`MAX_BLOCK_HASH_COUNT`] are
    /// dropped; returns whether the hash was added.
    pub fn add_block_hash(&mut self, hash: Sha256Hash) -> bool {
        if self.block_hashes.len() >= MAX_BLOCK_HASH_COUNT {
            return false;
        }
        self.block_hashes.push(hash);
        true
    }

    /// Stop the reply before this hash.
    pub fn set_stop_before(&mut self, hash: Option<Sha256Hash>) {
        self.stop_before = hash;
    }

    /// Starting hashes.
    pub fn block_hashes(&self) -> &[Sha256Hash] {
        &self.block_hashes
    }

    /// Stop-before hash.
    pub fn stop_before(&self) -> Option<Sha256Hash> {
        self.stop_before
    }
}

/// A block sent as header, ordered transaction hashes and the subset of
/// transactions the sender guessed the receiver lacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinBlock {
    /// Block header.
    pub header: BlockHeader,
    /// Every transaction hash, in block order.
    pub transaction_hashes: Vec<Sha256Hash>,
    /// Transactions the sender chose to include.
    pub transactions: Vec<Transaction>,
}

impl ThinBlock {
    /// Build the thin form of `block`, including only the transactions
    /// `include` selects.
    pub fn from_block(block: &Block, include: impl Fn(&Transaction) -> bool) -> Self {
        Self {
            header: block.header.clone(),
            transaction_hashes: block.transaction_hashes(),
            transactions: block
                .transactions
                .iter()
                .filter(|tx| include(tx))
                .cloned()
                .collect(),
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Block locator: known hashes, most recent first.
    BlockFinder { block_hashes: Vec<Sha256Hash> },
    /// Ask for inventory following the given hashes.
    QueryBlocks(QueryBlocks),
    /// Ask for one full block.
    RequestBlock { block_hash: Sha256Hash },
    /// Ask for headers following the given hashes.
    RequestBlockHeaders { block_hashes: Vec<Sha256Hash> },
    /// Ask for transactions by hash.
    RequestTransactions { transaction_hashes: Vec<Sha256Hash> },
    /// Ask for a thin block, with a filter of what the requester has.
    RequestThinBlock {
        block_hash: Sha256Hash,
        bloom_filter: BloomFilter,
    },
    /// Ask for the transactions a thin block could not resolve.
    RequestThinTransactions {
        block_hash: Sha256Hash,
        transaction_hashes: Vec<Sha256Hash>,
    },
    /// Announce block hashes.
    BlockInventory { block_hashes: Vec<Sha256Hash> },
    /// Headers, each with its block's transaction count.
    BlockHeaders {
        headers: Vec<BlockHeaderWithTransactionCount>,
    },
    /// A full block.
    Block(Box<Block>),
    /// A thin block.
    ThinBlock(Box<ThinBlock>),
    /// Transactions answering `RequestThinTransactions`.
    ThinTransactions {
        block_hash: Sha256Hash,
        transactions: Vec<Transaction>,
    },
    /// One transaction.
    Transaction(Transaction),
    /// The peer lacks the requested items.
    NotFound { hashes: Vec<Sha256Hash> },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::BlockFinder { .. } => "block_finder",
            Message::QueryBlocks(_) => "query_blocks",
            Message::RequestBlock { .. } => "request_block",
            Message::RequestBlockHeaders { .. } => "request_block_headers",
            Message::RequestTransactions { .. } => "request_transactions",
            Message::RequestThinBlock { .. } => "request_thin_block",
            Message::RequestThinTransactions { .. } => "request_thin_transactions",
            Message::BlockInventory { .. } => "block_inventory",
            Message::BlockHeaders { .. } => "block_headers",
            Message::Block(_) => "block",
            Message::ThinBlock(_) => "thin_block",
            Message::ThinTransactions { .. } => "thin_transactions",
            Message::Transaction(_) => "transaction",
            Message::NotFound { .. } => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_types::double_sha256;

    #[test]
    fn test_query_blocks_caps_hash_count() {
        let mut query = QueryBlocks::new();
        for i in 0..MAX_BLOCK_HASH_COUNT + 10 {
            let added = query.add_block_hash(double_sha256(&i.to_le_bytes()));
            assert_eq!(added, i < MAX_BLOCK_HASH_COUNT);
        }
        assert_eq!(query.block_hashes().len(), MAX_BLOCK_HASH_COUNT);
        assert_eq!(query.stop_before(), None);
    }
}
