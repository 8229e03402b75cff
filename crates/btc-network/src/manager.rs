//! Peer registry and connection manager.
//!
//! The manager owns every pending and active [`PeerNode`] behind one mutex.
//! Other components see only snapshots. Blockchain policy (feature gating,
//! bans, which requests exist) lives here; sockets stay behind
//! [`PeerTransport`].

use crate::correlator::{Expectation, RequestCorrelator, Response};
use crate::locator::block_finder_hashes;
use crate::thin::{ThinBlockAction, ThinBlockAssembler, ThinBlockEvent, ThinBlockReconciliation};
use crate::{
    BanFilter, HandshakeInfo, MemoryPoolEnquirer, Message, NetworkError, NetworkResult, PeerId,
    PeerNode, PeerState, PeerTransport, PenaltyReason, QueryBlocks, RequestError,
    SynchronizationStatus,
};
use btc_storage::{BlockStore, ChainStore, NodeId, PeerRecord, PeerStore, PendingBlockStore};
use btc_types::{
    Block, BlockHeaderWithTransactionCount, NodeFeature, NodeFeatures, Sha256Hash, Transaction,
};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mempool size below which thin blocks are not worth the extra round trip.
pub const MINIMUM_THIN_BLOCK_TRANSACTION_COUNT: usize = 64;

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Peers to re-dial when every connection is lost.
    pub max_node_count: usize,
    /// Lifetime of a correlated request.
    pub request_timeout: Duration,
    /// Mempool size required before thin blocks are attempted.
    pub minimum_thin_block_transaction_count: usize,
    /// Headers kept for header announcements.
    pub transmitted_header_cache_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_node_count: 8,
            request_timeout: Duration::from_secs(30),
            minimum_thin_block_transaction_count: MINIMUM_THIN_BLOCK_TRANSACTION_COUNT,
            transmitted_header_cache_size: 128,
        }
    }
}

/// Everything the manager depends on but does not own.
#[derive(Clone)]
pub struct ManagerCollaborators {
    pub transport: Arc<dyn PeerTransport>,
    pub peer_store: Arc<dyn PeerStore>,
    pub store: Arc<dyn BlockStore>,
    pub ban_filter: Arc<dyn BanFilter>,
    pub mempool: Arc<dyn MemoryPoolEnquirer>,
    pub sync_status: Arc<dyn SynchronizationStatus>,
}

/// Outcome of [`NodeManager::add_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeOutcome {
    /// Registered and dialing.
    Added,
    /// Same address already pending or active; nothing changed.
    Duplicate,
    /// The IP is banned.
    Banned,
    /// The manager no longer accepts peers.
    ShuttingDown,
}

/// Fired when unsolicited inventory created new pending blocks.
pub type InventoryCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct PeerSet {
    pending: HashMap<PeerId, PeerNode>,
    active: HashMap<PeerId, PeerNode>,
}

impl PeerSet {
    fn contains(&self, id: &PeerId) -> bool {
        self.pending.contains_key(id) || self.active.contains_key(id)
    }

    fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerNode> {
        match self.active.get_mut(id) {
            Some(node) => Some(node),
            None => self.pending.get_mut(id),
        }
    }

    fn remove(&mut self, id: &PeerId) -> Option<PeerNode> {
        self.active.remove(id).or_else(|| self.pending.remove(id))
    }

    fn remove_ip(&mut self, ip: IpAddr) -> Vec<PeerId> {
        let ids: Vec<PeerId> = self
            .pending
            .keys()
            .chain(self.active.keys())
            .filter(|id| id.ip() == ip)
            .copied()
            .collect();
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    fn drain(&mut self) -> Vec<PeerId> {
        self.pending
            .drain()
            .chain(self.active.drain())
            .map(|(id, _)| id)
            .collect()
    }
}

/// Bitcoin peer registry and request front end.
pub struct NodeManager {
    config: ManagerConfig,
    transport: Arc<dyn PeerTransport>,
    peer_store: Arc<dyn PeerStore>,
    store: Arc<dyn BlockStore>,
    ban_filter: Arc<dyn BanFilter>,
    mempool: Arc<dyn MemoryPoolEnquirer>,
    sync_status: Arc<dyn SynchronizationStatus>,
    peers: Mutex<PeerSet>,
    correlator: RequestCorrelator,
    assembler: ThinBlockAssembler,
    header_cache: Mutex<LruCache<Sha256Hash, BlockHeaderWithTransactionCount>>,
    inventory_callback: RwLock<Option<InventoryCallback>>,
    shutting_down: AtomicBool,
}

impl NodeManager {
    /// Create a manager with no peers.
    pub fn new(config: ManagerConfig, collaborators: ManagerCollaborators) -> Self {
        let cache_size =
            NonZeroUsize::new(config.transmitted_header_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            correlator: RequestCorrelator::new(config.request_timeout),
            assembler: ThinBlockAssembler::new(collaborators.mempool.clone()),
            header_cache: Mutex::new(LruCache::new(cache_size)),
            transport: collaborators.transport,
            peer_store: collaborators.peer_store,
            store: collaborators.store,
            ban_filter: collaborators.ban_filter,
            mempool: collaborators.mempool,
            sync_status: collaborators.sync_status,
            peers: Mutex::new(PeerSet::default()),
            inventory_callback: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
            config,
        }
    }

    /// Set the callback fired when inventory creates pending blocks.
    pub fn set_new_inventory_callback(&self, callback: InventoryCallback) {
        *self.inventory_callback.write() = Some(callback);
    }

    // ==================== Peer lifecycle ====================

    /// Register a peer that has not handshaked yet and start dialing it.
    pub fn add_node(&self, addr: SocketAddr) -> AddNodeOutcome {
        let id = PeerId::new(addr);
        if self.is_shutting_down() {
            self.transport.disconnect(id);
            return AddNodeOutcome::ShuttingDown;
        }

        let banned = self.peer_store.is_banned(addr.ip()).unwrap_or_else(|e| {
            warn!(ip = %addr.ip(), error = %e, "Failed to check ban list");
            false
        });
        if banned {
            debug!(peer = %id, "Refusing banned peer");
            self.transport.disconnect(id);
            return AddNodeOutcome::Banned;
        }

        {
            let mut peers = self.peers.lock();
            if peers.contains(&id) {
                return AddNodeOutcome::Duplicate;
            }
            peers.pending.insert(id, PeerNode::new(addr));
        }

        debug!(peer = %id, "Added node");
        self.transport.connect(addr);
        AddNodeOutcome::Added
    }

    /// The socket layer connected to a pending peer.
    pub fn on_connected(&self, peer: PeerId) {
        let mut peers = self.peers.lock();
        if let Some(node) = peers.pending.get_mut(&peer) {
            node.state = PeerState::Handshaking;
            node.last_message = Some(Instant::now());
        }
    }

    /// The version handshake with a pending peer completed.
    ///
    /// The peer stays pending until it is promoted, so a ban or a duplicate
    /// registration racing with the handshake sees it. Returns whether the
    /// peer was promoted to active.
    pub fn on_handshake_complete(&self, peer: PeerId, info: HandshakeInfo) -> bool {
        let record = {
            let mut peers = self.peers.lock();
            let Some(node) = peers.pending.get_mut(&peer) else {
                debug!(peer = %peer, "Handshake from unknown peer");
                return false;
            };
            node.complete_handshake(&info);
            node.to_record()
        };

        if let Err(e) = self
            .peer_store
            .update_handshake_info(&record, SystemTime::now())
        {
            warn!(peer = %peer, error = %e, "Failed to persist handshake");
        }

        let serves_chain = info.features.has(NodeFeature::BlockchainEnabled);
        if !serves_chain && !self.sync_status.is_blockchain_synchronized() {
            info!(peer = %peer, features = %info.features, "Rejecting peer without chain data");
            self.peers.lock().pending.remove(&peer);
            self.transport.disconnect(peer);
            return false;
        }

        let banned = self.peer_store.is_banned(peer.ip()).unwrap_or_else(|e| {
            warn!(ip = %peer.ip(), error = %e, "Failed to check ban list");
            false
        });

        let promoted = {
            let mut peers = self.peers.lock();
            let admissible =
                !banned && !self.is_shutting_down() && !peers.active.contains_key(&peer);
            // Gone if a ban or disconnect landed while the handshake persisted.
            match peers.pending.remove(&peer) {
                Some(mut node) if admissible => {
                    node.state = PeerState::Active;
                    node.last_message = Some(Instant::now());
                    peers.active.insert(peer, node);
                    true
                }
                _ => false,
            }
        };
        if !promoted {
            debug!(peer = %peer, banned, "Dropping peer at promotion");
            self.transport.disconnect(peer);
            return false;
        }

        info!(peer = %peer, features = %info.features, "Peer connected");
        self.on_node_connected(peer);
        true
    }

    fn on_node_connected(&self, peer: PeerId) {
        let block_hashes = self.current_block_finder();
        if block_hashes.is_empty() {
            return;
        }
        if let Err(e) = self
            .transport
            .send(peer, Message::BlockFinder { block_hashes })
        {
            debug!(peer = %peer, error = %e, "Failed to send block finder");
        }
    }

    /// The socket layer lost `peer`.
    pub fn on_disconnected(&self, peer: PeerId) {
        let (removed, none_left) = {
            let mut peers = self.peers.lock();
            let removed = peers.remove(&peer);
            let was_active = removed.as_ref().is_some_and(|n| n.state == PeerState::Active);
            (removed, was_active && peers.active.is_empty())
        };
        self.correlator.fail_peer(peer);

        let Some(node) = removed else {
            return;
        };
        debug!(peer = %peer, "Peer disconnected");

        if !node.handshake_complete {
            self.ban_filter.record_failed_connection(peer.ip());
            if self.ban_filter.should_ban_ip(peer.ip()) {
                info!(ip = %peer.ip(), "Banning after repeated failed connections");
                self.ban_node(peer.ip());
            }
        }

        if none_left && !self.is_shutting_down() {
            self.on_all_nodes_disconnected();
        }
    }

    fn on_all_nodes_disconnected(&self) {
        let required = NodeFeatures::full_node();
        match self.peer_store.find_peers(required, self.config.max_node_count) {
            Ok(records) => {
                info!(count = records.len(), "All peers lost, re-dialing known peers");
                for record in records {
                    self.add_node(record.addr());
                }
            }
            Err(e) => warn!(error = %e, "Failed to load known peers"),
        }
    }

    /// A decoded message arrived from `peer`.
    pub fn on_message(&self, peer: PeerId, message: Message) {
        if let Some(node) = self.peers.lock().get_mut(&peer) {
            node.last_message = Some(Instant::now());
        }

        let Some(message) = self.correlator.on_message(peer, message) else {
            return;
        };
        match message {
            Message::BlockInventory { block_hashes } => self.on_block_inventory(peer, block_hashes),
            other @ (Message::ThinTransactions { .. } | Message::Transaction(_)) => {
                debug!(peer = %peer, kind = other.kind(), "Unsolicited message");
                self.penalize(peer, PenaltyReason::UnsolicitedMessage);
            }
            other => debug!(peer = %peer, kind = other.kind(), "Ignoring message"),
        }
    }

    fn on_block_inventory(&self, peer: PeerId, block_hashes: Vec<Sha256Hash>) {
        let Some(node_id) = self.node_id_of(peer) else {
            return;
        };

        let mut created = 0usize;
        for hash in &block_hashes {
            match self.store.has_block_data(hash) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Failed to check block");
                    continue;
                }
            }
            match self.store.record_inventory(hash, node_id) {
                Ok(_) => created += 1,
                Err(e) => warn!(hash = %hash, error = %e, "Failed to record inventory"),
            }
        }

        if created > 0 {
            debug!(peer = %peer, count = created, "Received block inventory");
            let callback = self.inventory_callback.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    // ==================== Bans ====================

    /// Ban `ip` and disconnect every peer using it.
    ///
    /// Peers are disconnected even if the ban cannot be persisted.
    pub fn ban_node(&self, ip: IpAddr) {
        if let Err(e) = self.peer_store.set_banned(ip, true) {
            warn!(ip = %ip, error = %e, "Failed to persist ban");
        }

        let removed = self.peers.lock().remove_ip(ip);
        for peer in &removed {
            self.correlator.fail_peer(*peer);
            self.transport.disconnect(*peer);
        }
        info!(ip = %ip, disconnected = removed.len(), "Banned node");
    }

    /// Lift the ban on `ip`.
    pub fn unban_node(&self, ip: IpAddr) {
        if let Err(e) = self.peer_store.set_banned(ip, false) {
            warn!(ip = %ip, error = %e, "Failed to persist unban");
        }
        self.ban_filter.clear(ip);
        info!(ip = %ip, "Unbanned node");
    }

    /// Add a penalty to `peer`, banning its IP once the threshold is crossed.
    pub fn penalize(&self, peer: PeerId, reason: PenaltyReason) {
        let ban = match self.peers.lock().get_mut(&peer) {
            Some(node) => node.score.apply_penalty(reason),
            None => return,
        };
        debug!(peer = %peer, reason = %reason, "Penalized peer");
        if ban {
            warn!(peer = %peer, "Penalty threshold reached");
            self.ban_node(peer.ip());
        }
    }

    // ==================== Peer queries ====================

    /// Best-ranked active peer accepted by `filter`. Ties go to the lowest id.
    pub fn select_best_node(&self, filter: impl Fn(&PeerNode) -> bool) -> Option<PeerId> {
        self.peers
            .lock()
            .active
            .values()
            .filter(|node| filter(node))
            .max_by(|a, b| {
                a.score
                    .priority()
                    .total_cmp(&b.score.priority())
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|node| node.id)
    }

    /// Number of active peers.
    pub fn active_node_count(&self) -> usize {
        self.peers.lock().active.len()
    }

    /// Snapshot of the active peers, ordered by id.
    pub fn active_peers(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self.peers.lock().active.values().cloned().collect();
        peers.sort_by_key(|node| node.id);
        peers
    }

    /// Persisted identities of the active peers.
    pub fn connected_node_ids(&self) -> Vec<(NodeId, PeerId)> {
        self.active_peers()
            .into_iter()
            .filter_map(|node| self.node_id_of(node.id).map(|id| (id, node.id)))
            .collect()
    }

    fn node_id_of(&self, peer: PeerId) -> Option<NodeId> {
        let existing = self
            .peer_store
            .node_id(peer.ip(), peer.port())
            .map_err(|e| warn!(peer = %peer, error = %e, "Failed to look up node id"))
            .ok()?;
        if existing.is_some() {
            return existing;
        }
        self.peer_store
            .store_peer(&PeerRecord::new(peer.addr()))
            .map_err(|e| warn!(peer = %peer, error = %e, "Failed to store peer"))
            .ok()
    }

    /// Whether [`NodeManager::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Correlated requests still waiting for a reply.
    pub fn outstanding_request_count(&self) -> usize {
        self.correlator.outstanding()
    }

    // ==================== Broadcasts ====================

    /// Block finder for the current best header chain.
    pub fn current_block_finder(&self) -> Vec<Sha256Hash> {
        block_finder_hashes(&*self.store).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build block finder");
            Vec::new()
        })
    }

    /// Send a block finder to every active peer. Returns how many were sent.
    pub fn broadcast_block_finder(&self, block_hashes: &[Sha256Hash]) -> usize {
        let mut sent = 0;
        for node in self.active_peers() {
            let message = Message::BlockFinder {
                block_hashes: block_hashes.to_vec(),
            };
            match self.transport.send(node.id, message) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %node.id, error = %e, "Failed to send block finder"),
            }
        }
        sent
    }

    /// Ask peers for inventory of pending blocks nobody connected is known
    /// to have. Queries are spread over the active peers.
    pub fn find_node_inventory(&self) -> usize {
        let nodes = self.connected_node_ids();
        if nodes.is_empty() {
            return 0;
        }
        let node_ids: Vec<NodeId> = nodes.iter().map(|(id, _)| *id).collect();
        let plan = match self.store.inventory_plan(&node_ids) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Failed to build inventory plan");
                return 0;
            }
        };

        let mut sent = 0;
        for (index, query) in plan.into_iter().enumerate() {
            let (_, peer) = nodes[index % nodes.len()];
            let mut message = QueryBlocks::new();
            message.add_block_hash(query.start);
            message.set_stop_before(query.stop_before);
            match self.transport.send(peer, Message::QueryBlocks(message)) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "Failed to query inventory"),
            }
        }
        if sent > 0 {
            debug!(count = sent, "Requested node inventory");
        }
        sent
    }

    /// Fire-and-forget `QueryBlocks` for the hashes after `hash`.
    pub fn request_block_hashes_after(&self, hash: Sha256Hash) -> bool {
        let Some(peer) = self.select_best_node(|n| n.has_feature(NodeFeature::BlockchainEnabled))
        else {
            return false;
        };
        let mut query = QueryBlocks::new();
        query.add_block_hash(hash);
        match self.transport.send(peer, Message::QueryBlocks(query)) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to query block hashes");
                false
            }
        }
    }

    /// Announce a stored block to `peer`, by header if it asked for that.
    ///
    /// Returns `false` if the block is unknown or only its header is stored.
    pub fn transmit_block_hash(&self, peer: PeerId, hash: Sha256Hash) -> NetworkResult<bool> {
        let prefers_headers = self
            .peers
            .lock()
            .active
            .get(&peer)
            .map(|node| node.prefers_header_announcements)
            .ok_or(NetworkError::PeerNotFound(peer))?;

        let Some(header) = self.header_with_transaction_count(&hash)? else {
            debug!(peer = %peer, hash = %hash, "Skipping announcement of unknown block");
            return Ok(false);
        };

        let message = if prefers_headers {
            Message::BlockHeaders {
                headers: vec![header],
            }
        } else {
            Message::BlockInventory {
                block_hashes: vec![hash],
            }
        };
        self.transport.send(peer, message)?;
        Ok(true)
    }

    fn header_with_transaction_count(
        &self,
        hash: &Sha256Hash,
    ) -> NetworkResult<Option<BlockHeaderWithTransactionCount>> {
        if let Some(cached) = self.header_cache.lock().get(hash) {
            return Ok(Some(cached.clone()));
        }

        let Some(id) = self.store.block_id_of(hash)? else {
            return Ok(None);
        };
        let (Some(header), Some(transaction_count)) =
            (self.store.header_of(id)?, self.store.transaction_count(id)?)
        else {
            return Ok(None);
        };

        let entry = BlockHeaderWithTransactionCount {
            header,
            transaction_count,
        };
        self.header_cache.lock().put(*hash, entry.clone());
        Ok(Some(entry))
    }

    // ==================== Correlated requests ====================

    async fn dispatch(
        &self,
        peer: PeerId,
        expectation: Expectation,
        message: Message,
    ) -> Result<Response, RequestError> {
        let kind = message.kind();
        let ticket = self.correlator.register(peer, expectation);
        let started = Instant::now();

        if let Err(e) = self.transport.send(peer, message) {
            self.correlator.cancel(ticket.id());
            return Err(e.into());
        }

        let result = self.correlator.wait(ticket).await;
        if let Err(e) = &result {
            debug!(peer = %peer, kind, error = %e, "Request failed");
        }
        self.record_outcome(peer, &result, started.elapsed());
        result
    }

    fn record_outcome(
        &self,
        peer: PeerId,
        result: &Result<Response, RequestError>,
        elapsed: Duration,
    ) {
        let reason = match result {
            Ok(_) => {
                let ban = match self.peers.lock().active.get_mut(&peer) {
                    Some(node) => node.score.record_delivery(elapsed),
                    None => false,
                };
                if ban {
                    self.ban_node(peer.ip());
                }
                return;
            }
            Err(RequestError::Timeout) => {
                if let Some(node) = self.peers.lock().active.get_mut(&peer) {
                    node.score.record_failure();
                }
                PenaltyReason::RequestTimeout
            }
            Err(RequestError::NotFound) => PenaltyReason::NotFound,
            Err(RequestError::InvalidResponse(_)) => PenaltyReason::InvalidResponse,
            Err(_) => return,
        };
        self.penalize(peer, reason);
    }

    fn resolve_peer(
        &self,
        preferred: Option<PeerId>,
        filter: impl Fn(&PeerNode) -> bool,
    ) -> Result<PeerId, RequestError> {
        if let Some(peer) = preferred {
            if self.peers.lock().active.contains_key(&peer) {
                return Ok(peer);
            }
        }
        self.select_best_node(filter)
            .ok_or(RequestError::NoPeerAvailable)
    }

    /// Download one full block from `peer`, or from the best peer if `peer`
    /// is `None` or no longer active.
    pub async fn request_block(
        &self,
        hash: Sha256Hash,
        peer: Option<PeerId>,
    ) -> Result<Block, RequestError> {
        let peer = self.resolve_peer(peer, |n| n.has_feature(NodeFeature::BlockchainEnabled))?;
        let response = self
            .dispatch(
                peer,
                Expectation::Block(hash),
                Message::RequestBlock { block_hash: hash },
            )
            .await?;
        match response {
            Response::Block(block) => Ok(block),
            _ => Err(RequestError::InvalidResponse("expected block".to_string())),
        }
    }

    /// Whether a thin block is worth attempting right now.
    pub fn thin_blocks_worthwhile(&self) -> bool {
        self.sync_status.is_blockchain_synchronized()
            && self.mempool.transaction_count() >= self.config.minimum_thin_block_transaction_count
    }

    /// Download a block as a thin block, degrading to exactly one full block
    /// download whenever reconciliation does not succeed.
    ///
    /// The full block download goes to `fallback_peer` while it is active.
    pub async fn request_thin_block(
        &self,
        hash: Sha256Hash,
        fallback_peer: Option<PeerId>,
    ) -> Result<Block, RequestError> {
        if !self.thin_blocks_worthwhile() {
            return self.request_block(hash, fallback_peer).await;
        }
        let Some(peer) = self.select_best_node(|n| n.supports_thin_blocks()) else {
            return self.request_block(hash, fallback_peer).await;
        };

        let mut reconciliation = ThinBlockReconciliation::new(hash, self.assembler.clone());
        let reply = self
            .dispatch(
                peer,
                Expectation::ThinBlock(hash),
                Message::RequestThinBlock {
                    block_hash: hash,
                    bloom_filter: self.mempool.bloom_filter(&hash),
                },
            )
            .await;
        let mut action = reconciliation.handle(match reply {
            Ok(Response::ThinBlock(thin)) => ThinBlockEvent::ThinBlockReceived(thin),
            Ok(_) => ThinBlockEvent::RequestFailed(RequestError::InvalidResponse(
                "expected thin block".to_string(),
            )),
            Err(e) => ThinBlockEvent::RequestFailed(e),
        });

        loop {
            match action {
                ThinBlockAction::Emit(block) => return Ok(block),
                ThinBlockAction::RequestMissing(transaction_hashes) => {
                    let source = self
                        .select_best_node(|n| n.supports_thin_blocks())
                        .unwrap_or(peer);
                    let reply = self
                        .dispatch(
                            source,
                            Expectation::ThinTransactions(hash),
                            Message::RequestThinTransactions {
                                block_hash: hash,
                                transaction_hashes,
                            },
                        )
                        .await;
                    action = reconciliation.handle(match reply {
                        Ok(Response::ThinTransactions(transactions)) => {
                            ThinBlockEvent::MissingTransactionsReceived(transactions)
                        }
                        Ok(_) => ThinBlockEvent::RequestFailed(RequestError::InvalidResponse(
                            "expected thin transactions".to_string(),
                        )),
                        Err(e) => ThinBlockEvent::RequestFailed(e),
                    });
                }
                ThinBlockAction::FallbackToFullBlock | ThinBlockAction::None => {
                    return self.request_block(hash, fallback_peer).await;
                }
            }
        }
    }

    /// Fetch transactions by hash. An empty list sends nothing.
    pub async fn request_transactions(
        &self,
        transaction_hashes: &[Sha256Hash],
        peer: Option<PeerId>,
    ) -> Result<Vec<Transaction>, RequestError> {
        if transaction_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let peer = self.resolve_peer(peer, |_| true)?;
        let response = self
            .dispatch(
                peer,
                Expectation::Transactions(transaction_hashes.to_vec()),
                Message::RequestTransactions {
                    transaction_hashes: transaction_hashes.to_vec(),
                },
            )
            .await?;
        match response {
            Response::Transactions(transactions) => Ok(transactions),
            _ => Err(RequestError::InvalidResponse(
                "expected transactions".to_string(),
            )),
        }
    }

    /// Fetch the headers that follow the given locator hashes.
    pub async fn request_block_headers_after(
        &self,
        block_hashes: Vec<Sha256Hash>,
    ) -> Result<Vec<BlockHeaderWithTransactionCount>, RequestError> {
        let peer = self.resolve_peer(None, |n| n.has_feature(NodeFeature::BlockchainEnabled))?;
        let response = self
            .dispatch(
                peer,
                Expectation::BlockHeaders,
                Message::RequestBlockHeaders { block_hashes },
            )
            .await?;
        match response {
            Response::BlockHeaders(headers) => Ok(headers),
            _ => Err(RequestError::InvalidResponse("expected headers".to_string())),
        }
    }

    // ==================== Shutdown ====================

    /// Refuse new peers and disconnect the existing ones. Outstanding
    /// requests fail with `PeerDisconnected`.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = self.peers.lock().drain();
        for peer in &peers {
            self.correlator.fail_peer(*peer);
            self.transport.disconnect(*peer);
        }
        info!(disconnected = peers.len(), "Connection manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelTransport, EmptyMemoryPool, FailedConnectionBanFilter, NetworkCommand};
    use btc_storage::MemoryDatabase;
    use tokio::sync::mpsc;

    struct Synced(bool);

    impl SynchronizationStatus for Synced {
        fn is_blockchain_synchronized(&self) -> bool {
            self.0
        }
    }

    fn manager(synced: bool) -> (NodeManager, mpsc::UnboundedReceiver<NetworkCommand>) {
        let (transport, rx) = ChannelTransport::new();
        let db = Arc::new(MemoryDatabase::new());
        let manager = NodeManager::new(
            ManagerConfig::default(),
            ManagerCollaborators {
                transport: Arc::new(transport),
                peer_store: db.clone(),
                store: db,
                ban_filter: Arc::new(FailedConnectionBanFilter::default()),
                mempool: Arc::new(EmptyMemoryPool),
                sync_status: Arc::new(Synced(synced)),
            },
        );
        (manager, rx)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn full_node() -> HandshakeInfo {
        HandshakeInfo {
            features: NodeFeatures::full_node(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_node_rejects_duplicates() {
        let (manager, _rx) = manager(false);
        assert_eq!(manager.add_node(addr("10.0.0.1:8333")), AddNodeOutcome::Added);
        assert_eq!(manager.add_node(addr("10.0.0.1:8333")), AddNodeOutcome::Duplicate);
        assert_eq!(manager.add_node(addr("10.0.0.1:8334")), AddNodeOutcome::Added);
    }

    #[test]
    fn test_handshake_promotes_chain_peer() {
        let (manager, _rx) = manager(false);
        let a = addr("10.0.0.1:8333");
        manager.add_node(a);
        assert!(manager.on_handshake_complete(PeerId::new(a), full_node()));
        assert_eq!(manager.active_node_count(), 1);

        // Duplicate of an active peer.
        assert_eq!(manager.add_node(a), AddNodeOutcome::Duplicate);
    }

    #[test]
    fn test_spv_peer_rejected_during_bootstrap() {
        let (manager, mut rx) = manager(false);
        let a = addr("10.0.0.2:8333");
        manager.add_node(a);
        let spv = HandshakeInfo {
            features: NodeFeatures::of(&[NodeFeature::BloomConnectionsEnabled]),
            ..Default::default()
        };
        assert!(!manager.on_handshake_complete(PeerId::new(a), spv));
        assert_eq!(manager.active_node_count(), 0);

        assert_eq!(rx.try_recv().unwrap(), NetworkCommand::Connect { addr: a });
        assert_eq!(
            rx.try_recv().unwrap(),
            NetworkCommand::Disconnect {
                peer: PeerId::new(a)
            }
        );
    }

    #[test]
    fn test_spv_peer_accepted_once_synced() {
        let (manager, _rx) = manager(true);
        let a = addr("10.0.0.2:8333");
        manager.add_node(a);
        let spv = HandshakeInfo {
            features: NodeFeatures::of(&[NodeFeature::BloomConnectionsEnabled]),
            ..Default::default()
        };
        assert!(manager.on_handshake_complete(PeerId::new(a), spv));
    }

    #[test]
    fn test_ban_disconnects_every_peer_on_ip() {
        let (manager, _rx) = manager(false);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        manager.add_node(addr("10.0.0.3:8333"));
        manager.add_node(addr("10.0.0.3:8334"));
        manager.on_handshake_complete(PeerId::new(addr("10.0.0.3:8333")), full_node());

        manager.ban_node(ip);
        assert_eq!(manager.active_node_count(), 0);
        assert_eq!(manager.add_node(addr("10.0.0.3:8333")), AddNodeOutcome::Banned);

        manager.unban_node(ip);
        assert_eq!(manager.add_node(addr("10.0.0.3:8333")), AddNodeOutcome::Added);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connections_trigger_ban() {
        let (manager, _rx) = manager(false);
        for _ in 0..3 {
            let a = addr("10.0.0.4:8333");
            assert_eq!(manager.add_node(a), AddNodeOutcome::Added);
            manager.on_disconnected(PeerId::new(a));
        }
        assert_eq!(manager.add_node(addr("10.0.0.4:8333")), AddNodeOutcome::Banned);
    }

    #[test]
    fn test_shutdown_refuses_new_peers() {
        let (manager, _rx) = manager(false);
        let a = addr("10.0.0.5:8333");
        manager.add_node(a);
        manager.on_handshake_complete(PeerId::new(a), full_node());

        manager.shutdown();
        assert_eq!(manager.active_node_count(), 0);
        assert_eq!(
            manager.add_node(addr("10.0.0.6:8333")),
            AddNodeOutcome::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_request_without_peers_fails_immediately() {
        let (manager, mut rx) = manager(false);
        let result = manager.request_block(Sha256Hash::ZERO, None).await;
        assert_eq!(result, Err(RequestError::NoPeerAvailable));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_transaction_request_sends_nothing() {
        let (manager, mut rx) = manager(false);
        let a = addr("10.0.0.7:8333");
        manager.add_node(a);
        manager.on_handshake_complete(PeerId::new(a), full_node());
        while rx.try_recv().is_ok() {}

        let result = manager.request_transactions(&[], None).await;
        assert_eq!(result, Ok(Vec::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_zero_peers_housekeeping_is_noop() {
        let (manager, mut rx) = manager(false);
        assert_eq!(manager.broadcast_block_finder(&[Sha256Hash::ZERO]), 0);
        assert_eq!(manager.find_node_inventory(), 0);
        assert!(rx.try_recv().is_err());
    }
}
