//! Chain assembly.
//!
//! The builder drains downloaded pending blocks in parent-to-child order
//! and hands each to the [`BlockProcessor`]. Corrupt or rejected payloads
//! are deleted, never retried as they are. When no candidate exists it
//! asks for the next block the header chain already knows about.

use crate::processor::BlockProcessor;
use crate::requester::BlockDownloadRequester;
use crate::worker::{SleepyWorker, StatusMonitor, WorkerStatus};
use crate::SyncResult;
use btc_network::NodeManager;
use btc_storage::{BlockStore, ChainStore, PendingBlockId, PendingBlockStore, WriteBatch};
use btc_types::{Block, Sha256Hash, GENESIS_BLOCK_HASH};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Blocks applied per cycle before yielding back to the worker loop.
    pub max_blocks_per_cycle: usize,
    /// Broadcast the block finder while the downloader is idle.
    pub broadcast_block_finder_when_idle: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_cycle: 1_000,
            broadcast_block_finder_when_idle: true,
        }
    }
}

/// Fired for every block applied to the chain, off the assembly task.
pub type NewBlockProcessedCallback = Arc<dyn Fn(u64, Block) + Send + Sync>;

/// Chain assembly worker.
pub struct BlockchainBuilder {
    config: BuilderConfig,
    store: Arc<dyn BlockStore>,
    processor: Arc<dyn BlockProcessor>,
    manager: Arc<NodeManager>,
    download_status: Arc<dyn StatusMonitor>,
    requester: BlockDownloadRequester,
    has_genesis: AtomicBool,
    callback: RwLock<Option<NewBlockProcessedCallback>>,
}

impl BlockchainBuilder {
    /// Create a builder.
    pub fn new(
        config: BuilderConfig,
        store: Arc<dyn BlockStore>,
        processor: Arc<dyn BlockProcessor>,
        manager: Arc<NodeManager>,
        download_status: Arc<dyn StatusMonitor>,
        requester: BlockDownloadRequester,
    ) -> Self {
        Self {
            config,
            store,
            processor,
            manager,
            download_status,
            requester,
            has_genesis: AtomicBool::new(false),
            callback: RwLock::new(None),
        }
    }

    /// Set the callback fired for each applied block.
    pub fn set_new_block_processed_callback(&self, callback: NewBlockProcessedCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Whether the genesis block is known to be stored.
    pub fn has_genesis(&self) -> bool {
        self.has_genesis.load(Ordering::SeqCst)
    }

    /// Commit a pending genesis block if one has been downloaded.
    ///
    /// A payload that is not the genesis block is discarded.
    fn bootstrap_genesis(&self) -> SyncResult<bool> {
        if self.store.has_block_data(&GENESIS_BLOCK_HASH)? {
            return Ok(true);
        }

        let Some(pending_id) = self.store.pending_block_id(&GENESIS_BLOCK_HASH)? else {
            self.requester.request_block(&GENESIS_BLOCK_HASH)?;
            return Ok(false);
        };
        let data = match self.store.pending_block(pending_id)? {
            Some(pending) => pending.data,
            None => None,
        };
        let Some(data) = data else {
            self.requester.request_block(&GENESIS_BLOCK_HASH)?;
            return Ok(false);
        };

        let mut batch = WriteBatch::new();
        batch.delete_pending_block(pending_id);
        match Block::from_bytes(&data) {
            Ok(block) if block.hash() == GENESIS_BLOCK_HASH && block.has_valid_merkle_root() => {
                batch.store_block(block.clone());
                self.store.write_batch(batch)?;
                info!(hash = %GENESIS_BLOCK_HASH, "Stored genesis block");
                self.notify(0, block);
                Ok(true)
            }
            _ => {
                warn!("Discarding invalid genesis payload");
                self.store.write_batch(batch)?;
                Ok(false)
            }
        }
    }

    /// Apply one candidate and walk forward through its pending descendants.
    ///
    /// Returns whether any pending block was consumed.
    fn assemble(&self) -> SyncResult<bool> {
        let Some(candidate) = self.store.select_candidate()? else {
            self.request_next_block()?;
            return Ok(false);
        };

        let Some(mut last) = self.apply_pending(candidate)? else {
            return Ok(true);
        };

        let mut applied = 1;
        while applied < self.config.max_blocks_per_cycle {
            let mut advanced = false;
            // Lowest hash first; siblings stay pending for a later pass.
            for child in self.store.ids_with_parent_hash(&last)? {
                if !self.store.has_payload(child)? {
                    continue;
                }
                if let Some(hash) = self.apply_pending(child)? {
                    last = hash;
                    applied += 1;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
        }

        debug!(applied, head = %last, "Assembled blocks");
        Ok(true)
    }

    /// Decode and process one pending block, deleting its record either way.
    ///
    /// Returns the block hash if it was applied.
    fn apply_pending(&self, id: PendingBlockId) -> SyncResult<Option<Sha256Hash>> {
        let Some(pending) = self.store.pending_block(id)? else {
            return Ok(None);
        };
        let Some(data) = pending.data else {
            return Ok(None);
        };

        let block = match Block::from_bytes(&data) {
            Ok(block) if block.hash() == pending.hash => block,
            Ok(_) => {
                warn!(hash = %pending.hash, "Pending payload does not match its hash");
                self.delete_pending(id)?;
                return Ok(None);
            }
            Err(e) => {
                warn!(hash = %pending.hash, error = %e, "Corrupt pending block");
                self.delete_pending(id)?;
                return Ok(None);
            }
        };

        let height = self.processor.process_block(&block);
        self.delete_pending(id)?;
        match height {
            Some(height) => {
                debug!(hash = %pending.hash, height, "Applied block");
                self.notify(height, block);
                Ok(Some(pending.hash))
            }
            None => {
                warn!(hash = %pending.hash, "Block rejected");
                Ok(None)
            }
        }
    }

    fn delete_pending(&self, id: PendingBlockId) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_pending_block(id);
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Request the child of the head block if its header is already known.
    fn request_next_block(&self) -> SyncResult<()> {
        let (Some(segment), Some(head_block)) =
            (self.store.head_segment_id()?, self.store.head_block_id()?)
        else {
            return Ok(());
        };
        let Some(child) = self.store.child_of(segment, head_block)? else {
            return Ok(());
        };
        if let Some(hash) = self.store.hash_of(child)? {
            debug!(hash = %hash, "Requesting next block");
            self.requester.request_block(&hash)?;
        }
        Ok(())
    }

    fn notify(&self, height: u64, block: Block) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            tokio::task::spawn_blocking(move || callback(height, block));
        }
    }
}

impl SleepyWorker for BlockchainBuilder {
    fn name(&self) -> &'static str {
        "blockchain-builder"
    }

    async fn run_cycle(&self) -> bool {
        if !self.has_genesis() {
            match self.bootstrap_genesis() {
                Ok(true) => self.has_genesis.store(true, Ordering::SeqCst),
                Ok(false) => return false,
                Err(e) => {
                    warn!(error = %e, "Genesis bootstrap failed");
                    return false;
                }
            }
        }

        self.assemble().unwrap_or_else(|e| {
            warn!(error = %e, "Chain assembly failed");
            false
        })
    }

    async fn on_sleep(&self) {
        if !self.config.broadcast_block_finder_when_idle
            || self.download_status.status() == WorkerStatus::Active
        {
            return;
        }
        let block_hashes = self.manager.current_block_finder();
        if !block_hashes.is_empty() {
            self.manager.broadcast_block_finder(&block_hashes);
        }
    }
}
