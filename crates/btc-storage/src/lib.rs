//! # btc-storage
//!
//! Storage collaborators for the synchronization core.
//!
//! The core never talks to a database directly. It depends on three
//! narrow traits:
//! - [`PendingBlockStore`]: download bookkeeping between peers and assembly
//! - [`ChainStore`]: headers, blocks and blockchain segments
//! - [`PeerStore`]: persisted peer metadata and the ban list
//!
//! Multi-step mutations go through [`Storage::write_batch`] so they are
//! applied atomically. [`MemoryDatabase`] implements every trait over a
//! single lock.

mod batch;
mod error;
mod memory;
mod records;

pub use batch::{BatchOperation, WriteBatch};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryDatabase;
pub use records::{
    BlockId, BlockchainSegmentId, InventoryQuery, NodeId, PeerRecord, PendingBlock,
    PendingBlockId,
};

use btc_types::{Block, BlockHeader, NodeFeatures, Sha256Hash};
use std::net::IpAddr;
use std::time::SystemTime;

/// Storage trait for abstracting atomic writes.
///
/// This allows for easy testing with mock implementations.
pub trait Storage: Send + Sync {
    /// Execute a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;
}

/// Pending-block bookkeeping.
pub trait PendingBlockStore: Storage {
    /// Id of the pending record for `hash`, creating it if absent.
    fn get_or_create(&self, hash: &Sha256Hash) -> StorageResult<PendingBlockId>;

    /// Store a downloaded block's payload, creating the record if absent.
    fn store(&self, block: &Block) -> StorageResult<PendingBlockId> {
        self.store_payload(
            &block.hash(),
            Some(block.previous_block_hash()),
            &block.to_bytes(),
        )
    }

    /// Store raw payload bytes for `hash`, creating the record if absent.
    ///
    /// The bytes are not decoded here; chain assembly rejects corrupt ones.
    fn store_payload(
        &self,
        hash: &Sha256Hash,
        previous_hash: Option<Sha256Hash>,
        data: &[u8],
    ) -> StorageResult<PendingBlockId>;

    /// Delete a pending record.
    fn delete(&self, id: PendingBlockId) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_pending_block(id);
        self.write_batch(batch)
    }

    /// Increment the failed-download count, returning the new count.
    fn increment_failure_count(&self, id: PendingBlockId) -> StorageResult<u32>;

    /// Delete every record whose failure count exceeds `max_failures`.
    fn purge_failed(&self, max_failures: u32) -> StorageResult<usize>;

    /// Delete records that only disconnected nodes are known to have.
    fn purge_unlocatable(&self, connected: &[NodeId]) -> StorageResult<usize>;

    /// Next record eligible for chain assembly.
    fn select_candidate(&self) -> StorageResult<Option<PendingBlockId>>;

    /// Up to `limit` (pending block, node) download assignments.
    fn select_assignment_plan(
        &self,
        connected: &[NodeId],
        limit: usize,
    ) -> StorageResult<Vec<(PendingBlockId, NodeId)>>;

    /// Records declaring `hash` as their parent, lowest hash first.
    fn ids_with_parent_hash(&self, hash: &Sha256Hash) -> StorageResult<Vec<PendingBlockId>>;

    /// Whether the record's payload has been downloaded.
    fn has_payload(&self, id: PendingBlockId) -> StorageResult<bool>;

    /// Look up a record by block hash.
    fn pending_block_id(&self, hash: &Sha256Hash) -> StorageResult<Option<PendingBlockId>>;

    /// Load a full record.
    fn pending_block(&self, id: PendingBlockId) -> StorageResult<Option<PendingBlock>>;

    /// Block hash of a record.
    fn pending_block_hash(&self, id: PendingBlockId) -> StorageResult<Option<Sha256Hash>> {
        Ok(self.pending_block(id)?.map(|pending| pending.hash))
    }

    /// Record that `node` advertised `hash`.
    fn record_inventory(&self, hash: &Sha256Hash, node: NodeId) -> StorageResult<PendingBlockId>;

    /// Stamp the record with the current time.
    fn update_last_download_attempt(&self, id: PendingBlockId) -> StorageResult<()>;

    /// Drop records whose block is already stored in the chain.
    fn cleanup(&self) -> StorageResult<usize>;

    /// `QueryBlocks` plan for records no connected node is known to have.
    fn inventory_plan(&self, connected: &[NodeId]) -> StorageResult<Vec<InventoryQuery>>;
}

/// Headers, blocks and blockchain segments.
pub trait ChainStore: Storage {
    /// Segment of the best header chain.
    fn head_segment_id(&self) -> StorageResult<Option<BlockchainSegmentId>>;

    /// Highest block with its transactions stored.
    fn head_block_id(&self) -> StorageResult<Option<BlockId>>;

    /// Highest known header.
    fn head_header_id(&self) -> StorageResult<Option<BlockId>>;

    /// Child of `block` to follow when walking toward `segment`'s tip.
    fn child_of(
        &self,
        segment: BlockchainSegmentId,
        block: BlockId,
    ) -> StorageResult<Option<BlockId>>;

    /// Hash of a stored header.
    fn hash_of(&self, id: BlockId) -> StorageResult<Option<Sha256Hash>>;

    /// Id of a stored header.
    fn block_id_of(&self, hash: &Sha256Hash) -> StorageResult<Option<BlockId>>;

    /// Load a stored header.
    fn header_of(&self, id: BlockId) -> StorageResult<Option<BlockHeader>>;

    /// Height of a stored header (genesis is zero).
    fn height_of(&self, id: BlockId) -> StorageResult<Option<u64>>;

    /// Ancestor of `id` at `height` along its own branch.
    fn ancestor_at(&self, id: BlockId, height: u64) -> StorageResult<Option<BlockId>>;

    /// Whether the block's transactions are stored, not just its header.
    fn has_block_data(&self, hash: &Sha256Hash) -> StorageResult<bool>;

    /// Transaction count of a fully stored block.
    fn transaction_count(&self, id: BlockId) -> StorageResult<Option<usize>>;

    /// Store a header whose parent is already stored.
    fn store_header(&self, header: &BlockHeader) -> StorageResult<BlockId>;

    /// Store a block, including its header if not yet known.
    fn store_block(&self, block: &Block) -> StorageResult<BlockId> {
        let mut batch = WriteBatch::new();
        batch.store_block(block.clone());
        self.write_batch(batch)?;
        self.block_id_of(&block.hash())?
            .ok_or_else(|| StorageError::NotFound(block.hash().to_string()))
    }
}

/// Pending-block and chain storage backed by one database, so a single
/// [`WriteBatch`] can span both.
pub trait BlockStore: PendingBlockStore + ChainStore {}

impl<T: PendingBlockStore + ChainStore + ?Sized> BlockStore for T {}

/// Persisted peer metadata and the ban list.
pub trait PeerStore: Send + Sync {
    /// Insert or refresh a peer address, returning its id.
    fn store_peer(&self, peer: &PeerRecord) -> StorageResult<NodeId>;

    /// Id of a stored peer address.
    fn node_id(&self, ip: IpAddr, port: u16) -> StorageResult<Option<NodeId>>;

    /// Unbanned peers advertising every feature in `required`, most recent handshake first.
    fn find_peers(&self, required: NodeFeatures, limit: usize) -> StorageResult<Vec<PeerRecord>>;

    /// Whether `ip` is banned.
    fn is_banned(&self, ip: IpAddr) -> StorageResult<bool>;

    /// Set or clear the ban flag for `ip`.
    fn set_banned(&self, ip: IpAddr, banned: bool) -> StorageResult<()>;

    /// Record a completed handshake.
    fn update_handshake_info(
        &self,
        peer: &PeerRecord,
        handshake_time: SystemTime,
    ) -> StorageResult<()>;
}
