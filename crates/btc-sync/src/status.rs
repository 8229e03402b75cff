//! Chain synchronization status.

use btc_network::SynchronizationStatus;
use btc_storage::{BlockStore, ChainStore, StorageResult};
use std::sync::Arc;
use tracing::warn;

/// Synchronized once the best block has caught up with the best header.
#[derive(Clone)]
pub struct ChainSynchronizationStatus {
    store: Arc<dyn BlockStore>,
}

impl ChainSynchronizationStatus {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }

    fn check(&self) -> StorageResult<bool> {
        let head_block = self.store.head_block_id()?;
        Ok(head_block.is_some() && head_block == self.store.head_header_id()?)
    }
}

impl SynchronizationStatus for ChainSynchronizationStatus {
    fn is_blockchain_synchronized(&self) -> bool {
        self.check().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read chain head");
            false
        })
    }
}
