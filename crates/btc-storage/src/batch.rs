//! Write batch for atomic operations.

use crate::PendingBlockId;
use btc_types::Block;

/// A single batch operation.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Remove a pending block record and its payload.
    DeletePendingBlock(PendingBlockId),
    /// Store a full block (header and transactions) in the chain.
    StoreBlock(Box<Block>),
}

/// A batch of write operations to be executed atomically.
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Collected operations.
    pub(crate) operations: Vec<BatchOperation>,
}

impl WriteBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue deletion of a pending block.
    pub fn delete_pending_block(&mut self, id: PendingBlockId) {
        self.operations.push(BatchOperation::DeletePendingBlock(id));
    }

    /// Queue storage of a block.
    pub fn store_block(&mut self, block: Block) {
        self.operations
            .push(BatchOperation::StoreBlock(Box::new(block)));
    }

    /// Get the number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in insertion order.
    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    /// Merge another batch into this one.
    pub fn merge(&mut self, other: WriteBatch) {
        self.operations.extend(other.operations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.delete_pending_block(PendingBlockId(1));
        let mut other = WriteBatch::new();
        other.delete_pending_block(PendingBlockId(2));
        batch.merge(other);

        assert_eq!(batch.len(), 2);
        assert!(matches!(
            batch.operations()[1],
            BatchOperation::DeletePendingBlock(PendingBlockId(2))
        ));
    }
}
