//! Explicit block requests from chain assembly.

use crate::worker::WorkerHandle;
use crate::SyncResult;
use btc_storage::{BlockStore, PendingBlockId, PendingBlockStore};
use btc_types::Sha256Hash;
use std::sync::Arc;
use tracing::trace;

/// Queues a block for download and wakes the scheduler.
#[derive(Clone)]
pub struct BlockDownloadRequester {
    store: Arc<dyn BlockStore>,
    downloader: WorkerHandle,
}

impl BlockDownloadRequester {
    pub fn new(store: Arc<dyn BlockStore>, downloader: WorkerHandle) -> Self {
        Self { store, downloader }
    }

    /// Make sure a pending record exists for `hash` and wake the downloader.
    pub fn request_block(&self, hash: &Sha256Hash) -> SyncResult<PendingBlockId> {
        let id = self.store.get_or_create(hash)?;
        trace!(hash = %hash, pending = %id, "Requested block download");
        self.downloader.wake();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_storage::{MemoryDatabase, PendingBlockStore};
    use btc_types::double_sha256;

    #[test]
    fn test_request_is_idempotent() {
        let db = Arc::new(MemoryDatabase::new());
        let requester = BlockDownloadRequester::new(db.clone(), WorkerHandle::new("downloader"));
        let hash = double_sha256(b"requested");

        let first = requester.request_block(&hash).unwrap();
        let second = requester.request_block(&hash).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.pending_block_id(&hash).unwrap(), Some(first));
    }
}
