//! Test harness for integration tests.
//!
//! [`TestNetwork`] wires a real [`NodeManager`] to an in-memory database and
//! a simulated peer set. Commands the manager hands to its transport are
//! logged, and messages sent to peers are answered by a swappable
//! [`Responder`] whose replies are fed back through
//! [`NodeManager::on_message`] from a background task.

use btc_network::{
    BanFilter, ChannelTransport, FailedConnectionBanFilter, HandshakeInfo, ManagerCollaborators,
    ManagerConfig, MemoryPoolEnquirer, Message, NetworkCommand, NodeManager, PeerId,
    SynchronizationStatus, ThinBlock,
};
use btc_storage::{
    BlockStore, MemoryDatabase, NodeId, PeerRecord, PeerStore, StorageError, StorageResult,
};
use btc_types::{Block, BloomFilter, NodeFeatures, Sha256Hash, Transaction};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::trace;

/// Produces the replies a simulated peer sends for one message.
pub type Responder = Arc<dyn Fn(PeerId, &Message) -> Vec<Message> + Send + Sync>;

/// Parse a socket address literal.
pub fn peer_addr(addr: &str) -> SocketAddr {
    addr.parse().expect("valid socket address")
}

/// A responder that never answers.
pub fn silent() -> Responder {
    Arc::new(|_, _| Vec::new())
}

/// A responder that answers every block request with `NotFound`.
pub fn not_found() -> Responder {
    Arc::new(|_, message| match message {
        Message::RequestBlock { block_hash } | Message::RequestThinBlock { block_hash, .. } => {
            vec![Message::NotFound {
                hashes: vec![*block_hash],
            }]
        }
        _ => Vec::new(),
    })
}

/// Synchronization status that tests can flip.
#[derive(Debug, Default)]
pub struct FixedSyncStatus(AtomicBool);

impl FixedSyncStatus {
    pub fn new(synchronized: bool) -> Self {
        Self(AtomicBool::new(synchronized))
    }

    pub fn set(&self, synchronized: bool) {
        self.0.store(synchronized, Ordering::SeqCst);
    }
}

impl SynchronizationStatus for FixedSyncStatus {
    fn is_blockchain_synchronized(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A mempool holding a fixed set of transactions.
#[derive(Debug, Default)]
pub struct StaticMemoryPool {
    transactions: HashMap<Sha256Hash, Transaction>,
    reported_count: Option<usize>,
}

impl StaticMemoryPool {
    pub fn new(transactions: impl IntoIterator<Item = Transaction>) -> Self {
        Self {
            transactions: transactions
                .into_iter()
                .map(|tx| (tx.hash(), tx))
                .collect(),
            reported_count: None,
        }
    }

    /// Report `count` transactions regardless of what is held.
    pub fn with_reported_count(mut self, count: usize) -> Self {
        self.reported_count = Some(count);
        self
    }
}

impl MemoryPoolEnquirer for StaticMemoryPool {
    fn bloom_filter(&self, _block_hash: &Sha256Hash) -> BloomFilter {
        BloomFilter::empty()
    }

    fn transaction_count(&self) -> usize {
        self.reported_count.unwrap_or(self.transactions.len())
    }

    fn transaction(&self, hash: &Sha256Hash) -> Option<Transaction> {
        self.transactions.get(hash).cloned()
    }
}

/// Runs while a handshake is being persisted.
pub type HandshakeHook = Arc<dyn Fn(&PeerRecord) + Send + Sync>;

/// A [`PeerStore`] over [`MemoryDatabase`] whose writes can be made to fail.
pub struct FlakyPeerStore {
    inner: Arc<MemoryDatabase>,
    fail_writes: AtomicBool,
    handshake_hook: RwLock<Option<HandshakeHook>>,
}

impl FlakyPeerStore {
    pub fn new(inner: Arc<MemoryDatabase>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            handshake_hook: RwLock::new(None),
        }
    }

    /// Run `hook` inside every handshake write, before it is stored.
    pub fn on_handshake_write(&self, hook: HandshakeHook) {
        *self.handshake_hook.write() = Some(hook);
    }

    /// Make ban and handshake writes fail from now on.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl PeerStore for FlakyPeerStore {
    fn store_peer(&self, peer: &PeerRecord) -> StorageResult<NodeId> {
        self.inner.store_peer(peer)
    }

    fn node_id(&self, ip: IpAddr, port: u16) -> StorageResult<Option<NodeId>> {
        self.inner.node_id(ip, port)
    }

    fn find_peers(&self, required: NodeFeatures, limit: usize) -> StorageResult<Vec<PeerRecord>> {
        self.inner.find_peers(required, limit)
    }

    fn is_banned(&self, ip: IpAddr) -> StorageResult<bool> {
        self.inner.is_banned(ip)
    }

    fn set_banned(&self, ip: IpAddr, banned: bool) -> StorageResult<()> {
        self.check_writable()?;
        self.inner.set_banned(ip, banned)
    }

    fn update_handshake_info(
        &self,
        peer: &PeerRecord,
        handshake_time: SystemTime,
    ) -> StorageResult<()> {
        let hook = self.handshake_hook.read().clone();
        if let Some(hook) = hook {
            hook(peer);
        }
        self.check_writable()?;
        self.inner.update_handshake_info(peer, handshake_time)
    }
}

/// Serves blocks, thin blocks and transactions from a fixed set.
#[derive(Clone)]
pub struct BlockServer {
    blocks: HashMap<Sha256Hash, Block>,
    thin_include: Arc<dyn Fn(&Transaction) -> bool + Send + Sync>,
    serve_missing_transactions: bool,
}

impl BlockServer {
    /// Serve `blocks`. Thin blocks carry no transactions by default.
    pub fn new(blocks: impl IntoIterator<Item = Block>) -> Self {
        Self {
            blocks: blocks.into_iter().map(|b| (b.hash(), b)).collect(),
            thin_include: Arc::new(|_| false),
            serve_missing_transactions: true,
        }
    }

    /// Choose which transactions are sent inside thin blocks.
    pub fn thin_include(
        mut self,
        include: impl Fn(&Transaction) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.thin_include = Arc::new(include);
        self
    }

    /// Answer missing-transaction requests with an empty set.
    pub fn withhold_missing_transactions(mut self) -> Self {
        self.serve_missing_transactions = false;
        self
    }

    fn find_transaction(&self, hash: &Sha256Hash) -> Option<Transaction> {
        self.blocks
            .values()
            .flat_map(|block| block.transactions.iter())
            .find(|tx| tx.hash() == *hash)
            .cloned()
    }

    fn respond(&self, message: &Message) -> Vec<Message> {
        match message {
            Message::RequestBlock { block_hash } => match self.blocks.get(block_hash) {
                Some(block) => vec![Message::Block(Box::new(block.clone()))],
                None => vec![Message::NotFound {
                    hashes: vec![*block_hash],
                }],
            },
            Message::RequestThinBlock { block_hash, .. } => match self.blocks.get(block_hash) {
                Some(block) => vec![Message::ThinBlock(Box::new(ThinBlock::from_block(
                    block,
                    |tx| (self.thin_include)(tx),
                )))],
                None => vec![Message::NotFound {
                    hashes: vec![*block_hash],
                }],
            },
            Message::RequestThinTransactions {
                block_hash,
                transaction_hashes,
            } => {
                let transactions = if self.serve_missing_transactions {
                    transaction_hashes
                        .iter()
                        .filter_map(|hash| self.find_transaction(hash))
                        .collect()
                } else {
                    Vec::new()
                };
                vec![Message::ThinTransactions {
                    block_hash: *block_hash,
                    transactions,
                }]
            }
            Message::RequestTransactions { transaction_hashes } => {
                let mut replies = Vec::new();
                let mut missing = Vec::new();
                for hash in transaction_hashes {
                    match self.find_transaction(hash) {
                        Some(tx) => replies.push(Message::Transaction(tx)),
                        None => missing.push(*hash),
                    }
                }
                if !missing.is_empty() {
                    replies.push(Message::NotFound { hashes: missing });
                }
                replies
            }
            _ => Vec::new(),
        }
    }

    pub fn into_responder(self) -> Responder {
        Arc::new(move |_, message| self.respond(message))
    }
}

/// Builder for [`TestNetwork`].
pub struct TestNetworkBuilder {
    config: ManagerConfig,
    synced: bool,
    mempool: Arc<dyn MemoryPoolEnquirer>,
    ban_filter: Arc<dyn BanFilter>,
}

impl Default for TestNetworkBuilder {
    fn default() -> Self {
        Self {
            config: ManagerConfig::default(),
            synced: false,
            mempool: Arc::new(StaticMemoryPool::default()),
            ban_filter: Arc::new(FailedConnectionBanFilter::default()),
        }
    }
}

impl TestNetworkBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn synced(mut self, synced: bool) -> Self {
        self.synced = synced;
        self
    }

    pub fn mempool(mut self, mempool: impl MemoryPoolEnquirer + 'static) -> Self {
        self.mempool = Arc::new(mempool);
        self
    }

    pub fn ban_filter(mut self, ban_filter: impl BanFilter + 'static) -> Self {
        self.ban_filter = Arc::new(ban_filter);
        self
    }

    /// Build the network. Must be called inside a tokio runtime.
    pub fn build(self) -> TestNetwork {
        let db = Arc::new(MemoryDatabase::new());
        let store: Arc<dyn BlockStore> = db.clone();
        let peer_store = Arc::new(FlakyPeerStore::new(db.clone()));
        let sync_status = Arc::new(FixedSyncStatus::new(self.synced));

        let (transport, mut command_rx) = ChannelTransport::new();
        let manager = Arc::new(NodeManager::new(
            self.config,
            ManagerCollaborators {
                transport: Arc::new(transport),
                peer_store: peer_store.clone(),
                store: store.clone(),
                ban_filter: self.ban_filter,
                mempool: self.mempool,
                sync_status: sync_status.clone(),
            },
        ));

        let log: Arc<Mutex<Vec<NetworkCommand>>> = Arc::new(Mutex::new(Vec::new()));
        let responder: Arc<RwLock<Responder>> = Arc::new(RwLock::new(silent()));

        let task = {
            let log = log.clone();
            let responder = responder.clone();
            let manager = manager.clone();
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    trace!(?command, "Simulated network command");
                    log.lock().push(command.clone());
                    if let NetworkCommand::SendMessage { peer, message } = command {
                        let respond = responder.read().clone();
                        for reply in respond(peer, &message) {
                            manager.on_message(peer, reply);
                        }
                    }
                }
            })
        };

        TestNetwork {
            db,
            store,
            manager,
            peer_store,
            sync_status,
            log,
            responder,
            task,
        }
    }
}

/// A connection manager with simulated peers.
pub struct TestNetwork {
    pub db: Arc<MemoryDatabase>,
    pub store: Arc<dyn BlockStore>,
    pub manager: Arc<NodeManager>,
    pub peer_store: Arc<FlakyPeerStore>,
    pub sync_status: Arc<FixedSyncStatus>,
    log: Arc<Mutex<Vec<NetworkCommand>>>,
    responder: Arc<RwLock<Responder>>,
    task: JoinHandle<()>,
}

impl TestNetwork {
    pub fn builder() -> TestNetworkBuilder {
        TestNetworkBuilder::default()
    }

    /// Default network. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Replace how simulated peers answer.
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.write() = responder;
    }

    /// Dial, connect and handshake a peer advertising `features`.
    pub fn connect_peer(&self, addr: &str, features: NodeFeatures) -> PeerId {
        let info = HandshakeInfo {
            features,
            ..Default::default()
        };
        let peer = self.connect_peer_with(addr, info);
        assert!(
            self.manager.active_peers().iter().any(|n| n.id == peer),
            "peer {} was not promoted",
            peer
        );
        peer
    }

    /// Dial, connect and handshake a peer. The peer may be rejected.
    pub fn connect_peer_with(&self, addr: &str, info: HandshakeInfo) -> PeerId {
        let addr = peer_addr(addr);
        let peer = PeerId::new(addr);
        self.manager.add_node(addr);
        self.manager.on_connected(peer);
        self.manager.on_handshake_complete(peer, info);
        peer
    }

    /// Let the simulated peers and spawned downloads run.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// Every command the manager issued.
    pub fn commands(&self) -> Vec<NetworkCommand> {
        self.log.lock().clone()
    }

    /// Messages sent to peers, in order.
    pub fn sent_messages(&self) -> Vec<(PeerId, Message)> {
        self.log
            .lock()
            .iter()
            .filter_map(|command| match command {
                NetworkCommand::SendMessage { peer, message } => Some((*peer, message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of sent messages matching `predicate`.
    pub fn count_sent(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        self.sent_messages()
            .iter()
            .filter(|(_, message)| predicate(message))
            .count()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Store `blocks` directly in the chain.
    pub fn store_chain(&self, blocks: &[Block]) {
        use btc_storage::ChainStore;
        for block in blocks {
            self.db.store_block(block).expect("store block");
        }
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Whether `message` requests the full block `hash`.
pub fn is_block_request(message: &Message, hash: &Sha256Hash) -> bool {
    matches!(message, Message::RequestBlock { block_hash } if block_hash == hash)
}
