//! Node implementation.

use crate::config::NodeConfig;
use anyhow::Result;
use btc_network::{
    ChannelTransport, EmptyMemoryPool, FailedConnectionBanFilter, ManagerCollaborators,
    NetworkCommand, NodeManager,
};
use btc_storage::{BlockStore, ChainStore, MemoryDatabase};
use btc_sync::{
    BlockDownloadRequester, BlockDownloader, BlockchainBuilder, ChainStoreProcessor,
    ChainSynchronizationStatus, WorkerHandle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main loop ticks between status lines.
const STATUS_INTERVAL_TICKS: u64 = 30;

/// The main node struct coordinating all components.
pub struct Node {
    config: NodeConfig,
    database: Arc<MemoryDatabase>,
    manager: Arc<NodeManager>,
    downloader: Arc<BlockDownloader>,
    builder: Arc<BlockchainBuilder>,
    downloader_handle: WorkerHandle,
    builder_handle: WorkerHandle,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Node {
    /// Create a node and wire its components together.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let database = Arc::new(MemoryDatabase::new());
        let store: Arc<dyn BlockStore> = database.clone();

        let (transport, command_rx) = ChannelTransport::new();
        let manager = Arc::new(NodeManager::new(
            config.manager_config(),
            ManagerCollaborators {
                transport: Arc::new(transport),
                peer_store: database.clone(),
                store: Arc::clone(&store),
                ban_filter: Arc::new(FailedConnectionBanFilter::new(config.ban_policy())),
                mempool: Arc::new(EmptyMemoryPool),
                sync_status: Arc::new(ChainSynchronizationStatus::new(Arc::clone(&store))),
            },
        ));

        let downloader_handle = WorkerHandle::new("block-downloader");
        let builder_handle = WorkerHandle::new("blockchain-builder");

        let downloader = Arc::new(BlockDownloader::new(
            config.download_config(),
            Arc::clone(&manager),
            Arc::clone(&store),
        ));

        let requester = BlockDownloadRequester::new(Arc::clone(&store), downloader_handle.clone());
        let builder = Arc::new(BlockchainBuilder::new(
            config.builder_config(),
            Arc::clone(&store),
            Arc::new(ChainStoreProcessor::new(Arc::clone(&store))),
            Arc::clone(&manager),
            Arc::new(downloader_handle.clone()),
            requester,
        ));

        let wake_downloader = downloader_handle.clone();
        manager.set_new_inventory_callback(Arc::new(move || wake_downloader.wake()));

        let wake_builder = builder_handle.clone();
        downloader.set_new_block_available_callback(Arc::new(move || wake_builder.wake()));

        builder.set_new_block_processed_callback(Arc::new(|height, block| {
            info!(height, hash = %block.hash(), "New block");
        }));

        Ok(Arc::new(Self {
            config,
            database,
            manager,
            downloader,
            builder,
            downloader_handle,
            builder_handle,
            command_rx: Mutex::new(Some(command_rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Run the node until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!("Starting node services...");

        self.start_networking().await;
        self.start_sync().await;

        let mut ticks = 0u64;
        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ticks += 1;
            if ticks % STATUS_INTERVAL_TICKS == 0 {
                self.log_status();
            }
        }

        info!("Node main loop stopped");
        Ok(())
    }

    /// Drain transport commands and dial the configured peers.
    ///
    /// The socket layer is not part of this binary, so commands are only
    /// logged here.
    async fn start_networking(&self) {
        if let Some(mut command_rx) = self.command_rx.lock().await.take() {
            let task = tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    match command {
                        NetworkCommand::Connect { addr } => debug!(addr = %addr, "Dial"),
                        NetworkCommand::Disconnect { peer } => debug!(peer = %peer, "Disconnect"),
                        NetworkCommand::SendMessage { peer, message } => {
                            debug!(peer = %peer, message = ?message, "Send")
                        }
                    }
                }
            });
            self.tasks.lock().await.push(task);
        }

        for addr in self.config.known_peer_addrs() {
            let outcome = self.manager.add_node(addr);
            debug!(addr = %addr, outcome = ?outcome, "Added known peer");
        }
    }

    async fn start_sync(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.downloader_handle
                .spawn(Arc::clone(&self.downloader), self.config.downloader_sleep_period()),
        );
        tasks.push(
            self.builder_handle
                .spawn(Arc::clone(&self.builder), self.config.builder_sleep_period()),
        );
    }

    fn log_status(&self) {
        let height = match self.database.head_block_id() {
            Ok(Some(id)) => self.database.height_of(id).ok().flatten(),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read chain head: {}", e);
                None
            }
        };
        let stats = self.downloader.stats();
        info!(
            peers = self.manager.active_node_count(),
            height = ?height,
            headers = self.database.header_count(),
            pending = self.database.pending_block_count(),
            in_flight = stats.in_flight,
            downloaded = stats.completed,
            failed = stats.failed,
            stalls = stats.stalls,
            "Status"
        );
    }

    /// Shutdown the node.
    pub async fn shutdown(&self) {
        info!("Shutting down node...");
        self.shutdown.store(true, Ordering::SeqCst);

        self.manager.shutdown();
        self.downloader_handle.stop();
        self.builder_handle.stop();

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        info!("Node shutdown complete");
    }
}
