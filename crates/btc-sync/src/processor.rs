//! Block validation seam.

use btc_storage::{BlockStore, ChainStore};
use btc_types::Block;
use std::sync::Arc;
use tracing::{debug, warn};

/// Validates and applies one block.
pub trait BlockProcessor: Send + Sync {
    /// Apply `block`, returning its height, or `None` if it was rejected.
    fn process_block(&self, block: &Block) -> Option<u64>;
}

/// Stores blocks after checking only their merkle root and linkage.
///
/// Consensus rules are out of scope here; a full validator wraps or
/// replaces this.
#[derive(Clone)]
pub struct ChainStoreProcessor {
    store: Arc<dyn BlockStore>,
}

impl ChainStoreProcessor {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

impl BlockProcessor for ChainStoreProcessor {
    fn process_block(&self, block: &Block) -> Option<u64> {
        if !block.has_valid_merkle_root() {
            debug!(hash = %block.hash(), "Rejecting block with invalid merkle root");
            return None;
        }

        let id = match self.store.store_block(block) {
            Ok(id) => id,
            Err(e) => {
                warn!(hash = %block.hash(), error = %e, "Failed to store block");
                return None;
            }
        };
        match self.store.height_of(id) {
            Ok(height) => height,
            Err(e) => {
                warn!(hash = %block.hash(), error = %e, "Failed to read block height");
                None
            }
        }
    }
}
