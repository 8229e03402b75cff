//! In-memory database backing every storage collaborator.

use crate::{
    BatchOperation, BlockId, BlockchainSegmentId, ChainStore, InventoryQuery, NodeId, PeerRecord,
    PeerStore, PendingBlock, PendingBlockId, PendingBlockStore, Storage, StorageError,
    StorageResult, WriteBatch,
};
use btc_types::{Block, BlockHeader, NodeFeatures, Sha256Hash};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, trace};

/// Maximum entries returned by an inventory plan.
const INVENTORY_PLAN_LIMIT: usize = 32;

#[derive(Debug, Clone)]
struct StoredHeader {
    header: BlockHeader,
    hash: Sha256Hash,
    parent: Option<BlockId>,
    height: u64,
    segment: BlockchainSegmentId,
    /// Set once the block's transactions are stored.
    transaction_count: Option<usize>,
}

#[derive(Debug, Default)]
struct Tables {
    next_pending_id: u64,
    pending: HashMap<PendingBlockId, PendingBlock>,
    pending_by_hash: HashMap<Sha256Hash, PendingBlockId>,
    inventory: HashMap<PendingBlockId, HashSet<NodeId>>,

    next_block_id: u64,
    next_segment_id: u64,
    headers: HashMap<BlockId, StoredHeader>,
    block_ids: HashMap<Sha256Hash, BlockId>,
    children: HashMap<BlockId, Vec<BlockId>>,
    head_header: Option<BlockId>,
    head_block: Option<BlockId>,

    next_node_id: u64,
    peers: HashMap<NodeId, PeerRecord>,
    node_ids: HashMap<(IpAddr, u16), NodeId>,
    banned: HashSet<IpAddr>,
}

impl Tables {
    fn create_pending(&mut self, hash: &Sha256Hash) -> PendingBlockId {
        if let Some(id) = self.pending_by_hash.get(hash) {
            return *id;
        }

        self.next_pending_id += 1;
        let id = PendingBlockId(self.next_pending_id);
        self.pending.insert(
            id,
            PendingBlock {
                id,
                hash: *hash,
                previous_hash: None,
                data: None,
                failed_download_count: 0,
                last_download_attempt: None,
                priority: self.next_pending_id,
            },
        );
        self.pending_by_hash.insert(*hash, id);
        trace!(pending = %id, hash = %hash, "Created pending block");
        id
    }

    fn delete_pending(&mut self, id: PendingBlockId) {
        if let Some(pending) = self.pending.remove(&id) {
            self.pending_by_hash.remove(&pending.hash);
        }
        self.inventory.remove(&id);
    }

    fn has_block_data(&self, hash: &Sha256Hash) -> bool {
        self.block_ids
            .get(hash)
            .and_then(|id| self.headers.get(id))
            .map_or(false, |stored| stored.transaction_count.is_some())
    }

    fn stored(&self, id: BlockId) -> StorageResult<&StoredHeader> {
        self.headers
            .get(&id)
            .ok_or_else(|| StorageError::Corruption(format!("dangling block id {}", id)))
    }

    fn new_segment(&mut self) -> BlockchainSegmentId {
        self.next_segment_id += 1;
        BlockchainSegmentId(self.next_segment_id)
    }

    fn insert_header(&mut self, header: &BlockHeader) -> StorageResult<BlockId> {
        let hash = header.hash();
        if let Some(id) = self.block_ids.get(&hash) {
            return Ok(*id);
        }

        let (parent, height, segment) = if header.is_genesis() {
            (None, 0, self.new_segment())
        } else {
            let parent_id = *self
                .block_ids
                .get(&header.previous_block_hash)
                .ok_or(StorageError::MissingParent(header.previous_block_hash))?;
            let (parent_height, parent_segment) = {
                let parent = self.stored(parent_id)?;
                (parent.height, parent.segment)
            };
            let has_sibling = self
                .children
                .get(&parent_id)
                .map_or(false, |children| !children.is_empty());
            let segment = if has_sibling {
                self.new_segment()
            } else {
                parent_segment
            };
            (Some(parent_id), parent_height + 1, segment)
        };

        self.next_block_id += 1;
        let id = BlockId(self.next_block_id);
        self.headers.insert(
            id,
            StoredHeader {
                header: header.clone(),
                hash,
                parent,
                height,
                segment,
                transaction_count: None,
            },
        );
        self.block_ids.insert(hash, id);
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().push(id);
        }

        let is_new_head = match self.head_header {
            Some(head) => height > self.stored(head)?.height,
            None => true,
        };
        if is_new_head {
            self.head_header = Some(id);
        }

        debug!(hash = %hash, height, segment = %segment, "Stored header");
        Ok(id)
    }

    fn insert_block(&mut self, block: &Block) -> StorageResult<BlockId> {
        let id = self.insert_header(&block.header)?;
        let height = {
            let stored = self
                .headers
                .get_mut(&id)
                .ok_or_else(|| StorageError::Corruption(format!("dangling block id {}", id)))?;
            stored.transaction_count = Some(block.transaction_count());
            stored.height
        };

        let is_new_head = match self.head_block {
            Some(head) => height > self.stored(head)?.height,
            None => true,
        };
        if is_new_head {
            self.head_block = Some(id);
        }
        Ok(id)
    }

    /// Reject the whole batch before touching anything.
    fn validate_batch(&self, batch: &WriteBatch) -> StorageResult<()> {
        let mut staged = HashSet::new();
        for operation in batch.operations() {
            if let BatchOperation::StoreBlock(block) = operation {
                let parent = block.previous_block_hash();
                let parent_known = block.header.is_genesis()
                    || self.block_ids.contains_key(&parent)
                    || staged.contains(&parent);
                if !parent_known {
                    return Err(StorageError::MissingParent(parent));
                }
                staged.insert(block.hash());
            }
        }
        Ok(())
    }

    fn is_ancestor(&self, ancestor: BlockId, of: BlockId) -> StorageResult<bool> {
        let height = self.stored(ancestor)?.height;
        Ok(self.ancestor_at(of, height)? == Some(ancestor))
    }

    fn ancestor_at(&self, id: BlockId, height: u64) -> StorageResult<Option<BlockId>> {
        let mut current = id;
        loop {
            let stored = self.stored(current)?;
            if stored.height == height {
                return Ok(Some(current));
            }
            if stored.height < height {
                return Ok(None);
            }
            match stored.parent {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }

    fn upsert_peer(&mut self, peer: &PeerRecord) -> NodeId {
        let key = (peer.ip, peer.port);
        if let Some(id) = self.node_ids.get(&key).copied() {
            if let Some(existing) = self.peers.get_mut(&id) {
                if peer.features != NodeFeatures::NONE {
                    existing.features = peer.features;
                }
                if peer.user_agent.is_some() {
                    existing.user_agent = peer.user_agent.clone();
                }
                if peer.last_handshake.is_some() {
                    existing.last_handshake = peer.last_handshake;
                }
            }
            return id;
        }

        self.next_node_id += 1;
        let id = NodeId(self.next_node_id);
        self.peers.insert(id, peer.clone());
        self.node_ids.insert(key, id);
        id
    }

    fn remove_where(&mut self, predicate: impl Fn(&Self, &PendingBlock) -> bool) -> usize {
        let doomed: Vec<PendingBlockId> = self
            .pending
            .values()
            .filter(|pending| predicate(self, pending))
            .map(|pending| pending.id)
            .collect();
        for id in &doomed {
            self.delete_pending(*id);
        }
        doomed.len()
    }

    fn advertised_by_connected(&self, id: PendingBlockId, connected: &HashSet<NodeId>) -> bool {
        self.inventory
            .get(&id)
            .map_or(false, |nodes| nodes.iter().any(|node| connected.contains(node)))
    }

    fn sorted_incomplete(&self) -> Vec<&PendingBlock> {
        let mut incomplete: Vec<&PendingBlock> = self
            .pending
            .values()
            .filter(|pending| !pending.has_payload())
            .collect();
        incomplete.sort_by_key(|pending| (pending.priority, pending.hash));
        incomplete
    }
}

/// In-memory database.
///
/// All tables sit behind one lock, so every trait method and every
/// [`WriteBatch`] is atomic with respect to the others.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending block records.
    pub fn pending_block_count(&self) -> usize {
        self.tables.read().pending.len()
    }

    /// Number of stored headers.
    pub fn header_count(&self) -> usize {
        self.tables.read().headers.len()
    }
}

impl Storage for MemoryDatabase {
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut tables = self.tables.write();
        tables.validate_batch(&batch)?;

        for operation in batch.operations {
            match operation {
                BatchOperation::DeletePendingBlock(id) => tables.delete_pending(id),
                BatchOperation::StoreBlock(block) => {
                    tables.insert_block(&block)?;
                }
            }
        }
        Ok(())
    }
}

impl PendingBlockStore for MemoryDatabase {
    fn get_or_create(&self, hash: &Sha256Hash) -> StorageResult<PendingBlockId> {
        Ok(self.tables.write().create_pending(hash))
    }

    fn store_payload(
        &self,
        hash: &Sha256Hash,
        previous_hash: Option<Sha256Hash>,
        data: &[u8],
    ) -> StorageResult<PendingBlockId> {
        let mut tables = self.tables.write();
        let id = tables.create_pending(hash);
        if let Some(pending) = tables.pending.get_mut(&id) {
            if previous_hash.is_some() {
                pending.previous_hash = previous_hash;
            }
            pending.data = Some(Bytes::copy_from_slice(data));
        }
        Ok(id)
    }

    fn increment_failure_count(&self, id: PendingBlockId) -> StorageResult<u32> {
        let mut tables = self.tables.write();
        let pending = tables
            .pending
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("pending block {}", id)))?;
        pending.failed_download_count += 1;
        Ok(pending.failed_download_count)
    }

    fn purge_failed(&self, max_failures: u32) -> StorageResult<usize> {
        let purged = self
            .tables
            .write()
            .remove_where(|_, pending| pending.failed_download_count > max_failures);
        if purged > 0 {
            debug!(count = purged, "Purged failed pending blocks");
        }
        Ok(purged)
    }

    fn purge_unlocatable(&self, connected: &[NodeId]) -> StorageResult<usize> {
        let connected: HashSet<NodeId> = connected.iter().copied().collect();
        let purged = self.tables.write().remove_where(|tables, pending| {
            !pending.has_payload()
                && tables
                    .inventory
                    .get(&pending.id)
                    .map_or(false, |nodes| !nodes.is_empty())
                && !tables.advertised_by_connected(pending.id, &connected)
        });
        if purged > 0 {
            debug!(count = purged, "Purged unlocatable pending blocks");
        }
        Ok(purged)
    }

    fn select_candidate(&self) -> StorageResult<Option<PendingBlockId>> {
        let tables = self.tables.read();
        let candidate = tables
            .pending
            .values()
            .filter(|pending| pending.has_payload())
            .filter(|pending| {
                pending
                    .previous_hash
                    .map_or(false, |parent| tables.has_block_data(&parent))
            })
            .filter(|pending| !tables.has_block_data(&pending.hash))
            .min_by_key(|pending| (pending.priority, pending.hash))
            .map(|pending| pending.id);
        Ok(candidate)
    }

    fn select_assignment_plan(
        &self,
        connected: &[NodeId],
        limit: usize,
    ) -> StorageResult<Vec<(PendingBlockId, NodeId)>> {
        if connected.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let tables = self.tables.read();
        let mut round_robin = 0usize;
        let plan = tables
            .sorted_incomplete()
            .into_iter()
            .take(limit)
            .map(|pending| {
                let advertised = tables.inventory.get(&pending.id).and_then(|nodes| {
                    connected
                        .iter()
                        .copied()
                        .filter(|node| nodes.contains(node))
                        .min()
                });
                let node = advertised.unwrap_or_else(|| {
                    let node = connected[round_robin % connected.len()];
                    round_robin += 1;
                    node
                });
                (pending.id, node)
            })
            .collect();
        Ok(plan)
    }

    fn ids_with_parent_hash(&self, hash: &Sha256Hash) -> StorageResult<Vec<PendingBlockId>> {
        let tables = self.tables.read();
        let mut children: Vec<&PendingBlock> = tables
            .pending
            .values()
            .filter(|pending| pending.previous_hash.as_ref() == Some(hash))
            .collect();
        children.sort_by_key(|pending| pending.hash);
        Ok(children.into_iter().map(|pending| pending.id).collect())
    }

    fn has_payload(&self, id: PendingBlockId) -> StorageResult<bool> {
        Ok(self
            .tables
            .read()
            .pending
            .get(&id)
            .map_or(false, PendingBlock::has_payload))
    }

    fn pending_block_id(&self, hash: &Sha256Hash) -> StorageResult<Option<PendingBlockId>> {
        Ok(self.tables.read().pending_by_hash.get(hash).copied())
    }

    fn pending_block(&self, id: PendingBlockId) -> StorageResult<Option<PendingBlock>> {
        Ok(self.tables.read().pending.get(&id).cloned())
    }

    fn record_inventory(&self, hash: &Sha256Hash, node: NodeId) -> StorageResult<PendingBlockId> {
        let mut tables = self.tables.write();
        let id = tables.create_pending(hash);
        tables.inventory.entry(id).or_default().insert(node);
        Ok(id)
    }

    fn update_last_download_attempt(&self, id: PendingBlockId) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let pending = tables
            .pending
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("pending block {}", id)))?;
        pending.last_download_attempt = Some(Instant::now());
        Ok(())
    }

    fn cleanup(&self) -> StorageResult<usize> {
        Ok(self
            .tables
            .write()
            .remove_where(|tables, pending| tables.has_block_data(&pending.hash)))
    }

    fn inventory_plan(&self, connected: &[NodeId]) -> StorageResult<Vec<InventoryQuery>> {
        let connected: HashSet<NodeId> = connected.iter().copied().collect();
        let tables = self.tables.read();
        let head_hash = match tables.head_block {
            Some(head) => Some(tables.stored(head)?.hash),
            None => None,
        };

        let plan = tables
            .sorted_incomplete()
            .into_iter()
            .filter(|pending| !tables.advertised_by_connected(pending.id, &connected))
            .filter_map(|pending| match pending.previous_hash {
                Some(previous) => Some(InventoryQuery {
                    start: previous,
                    stop_before: Some(pending.hash),
                }),
                None => head_hash.map(|start| InventoryQuery {
                    start,
                    stop_before: None,
                }),
            })
            .take(INVENTORY_PLAN_LIMIT)
            .collect();
        Ok(plan)
    }
}

impl ChainStore for MemoryDatabase {
    fn head_segment_id(&self) -> StorageResult<Option<BlockchainSegmentId>> {
        let tables = self.tables.read();
        match tables.head_header {
            Some(head) => Ok(Some(tables.stored(head)?.segment)),
            None => Ok(None),
        }
    }

    fn head_block_id(&self) -> StorageResult<Option<BlockId>> {
        Ok(self.tables.read().head_block)
    }

    fn head_header_id(&self) -> StorageResult<Option<BlockId>> {
        Ok(self.tables.read().head_header)
    }

    fn child_of(
        &self,
        segment: BlockchainSegmentId,
        block: BlockId,
    ) -> StorageResult<Option<BlockId>> {
        let tables = self.tables.read();
        let children = match tables.children.get(&block) {
            Some(children) if !children.is_empty() => children,
            _ => return Ok(None),
        };

        for child in children {
            if tables.stored(*child)?.segment == segment {
                return Ok(Some(*child));
            }
        }
        if let Some(head) = tables.head_header {
            for child in children {
                if tables.is_ancestor(*child, head)? {
                    return Ok(Some(*child));
                }
            }
        }
        Ok(children.first().copied())
    }

    fn hash_of(&self, id: BlockId) -> StorageResult<Option<Sha256Hash>> {
        Ok(self.tables.read().headers.get(&id).map(|stored| stored.hash))
    }

    fn block_id_of(&self, hash: &Sha256Hash) -> StorageResult<Option<BlockId>> {
        Ok(self.tables.read().block_ids.get(hash).copied())
    }

    fn header_of(&self, id: BlockId) -> StorageResult<Option<BlockHeader>> {
        Ok(self
            .tables
            .read()
            .headers
            .get(&id)
            .map(|stored| stored.header.clone()))
    }

    fn height_of(&self, id: BlockId) -> StorageResult<Option<u64>> {
        Ok(self.tables.read().headers.get(&id).map(|stored| stored.height))
    }

    fn ancestor_at(&self, id: BlockId, height: u64) -> StorageResult<Option<BlockId>> {
        let tables = self.tables.read();
        if !tables.headers.contains_key(&id) {
            return Ok(None);
        }
        tables.ancestor_at(id, height)
    }

    fn has_block_data(&self, hash: &Sha256Hash) -> StorageResult<bool> {
        Ok(self.tables.read().has_block_data(hash))
    }

    fn transaction_count(&self, id: BlockId) -> StorageResult<Option<usize>> {
        Ok(self
            .tables
            .read()
            .headers
            .get(&id)
            .and_then(|stored| stored.transaction_count))
    }

    fn store_header(&self, header: &BlockHeader) -> StorageResult<BlockId> {
        self.tables.write().insert_header(header)
    }
}

impl PeerStore for MemoryDatabase {
    fn store_peer(&self, peer: &PeerRecord) -> StorageResult<NodeId> {
        Ok(self.tables.write().upsert_peer(peer))
    }

    fn node_id(&self, ip: IpAddr, port: u16) -> StorageResult<Option<NodeId>> {
        Ok(self.tables.read().node_ids.get(&(ip, port)).copied())
    }

    fn find_peers(&self, required: NodeFeatures, limit: usize) -> StorageResult<Vec<PeerRecord>> {
        let tables = self.tables.read();
        let mut peers: Vec<PeerRecord> = tables
            .peers
            .values()
            .filter(|peer| peer.features.contains(required))
            .filter(|peer| !tables.banned.contains(&peer.ip))
            .cloned()
            .collect();
        peers.sort_by(|a, b| b.last_handshake.cmp(&a.last_handshake));
        peers.truncate(limit);
        Ok(peers)
    }

    fn is_banned(&self, ip: IpAddr) -> StorageResult<bool> {
        Ok(self.tables.read().banned.contains(&ip))
    }

    fn set_banned(&self, ip: IpAddr, banned: bool) -> StorageResult<()> {
        let mut tables = self.tables.write();
        if banned {
            tables.banned.insert(ip);
        } else {
            tables.banned.remove(&ip);
        }
        Ok(())
    }

    fn update_handshake_info(
        &self,
        peer: &PeerRecord,
        handshake_time: SystemTime,
    ) -> StorageResult<()> {
        let mut record = peer.clone();
        record.last_handshake = Some(handshake_time);
        self.tables.write().upsert_peer(&record);
        Ok(())
    }
}
