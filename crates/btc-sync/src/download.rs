//! Block download scheduler.

use crate::worker::SleepyWorker;
use btc_network::{NodeManager, PeerId, RequestError};
use btc_storage::{BlockStore, ChainStore, NodeId, PendingBlockId, PendingBlockStore};
use btc_types::{Block, Sha256Hash, GENESIS_BLOCK_HASH};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failures after which a pending block is purged.
pub const MAX_DOWNLOAD_FAILURE_COUNT: u32 = 10;

/// Hard cap on concurrent downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 21;

/// Concurrent download budget for `active_peers` peers:
/// `min(max, 3 * active_peers + 1)`.
pub fn concurrency_budget(active_peers: usize, max: usize) -> usize {
    max.min(active_peers.saturating_mul(3).saturating_add(1))
}

/// Download configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Upper bound of the concurrency budget.
    pub max_concurrent_downloads: usize,
    /// How long to wait for a free slot before declaring a stall.
    pub stall_timeout: Duration,
    /// Minimum time between explicit genesis requests.
    pub genesis_retry_interval: Duration,
    /// Failures tolerated before a pending block is purged.
    pub max_failure_count: u32,
    /// Try thin blocks when the manager deems them worthwhile.
    pub thin_blocks_enabled: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: MAX_CONCURRENT_DOWNLOADS,
            stall_timeout: Duration::from_secs(90),
            genesis_retry_interval: Duration::from_secs(30),
            max_failure_count: MAX_DOWNLOAD_FAILURE_COUNT,
            thin_blocks_enabled: true,
        }
    }
}

/// Download statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Downloads currently in flight.
    pub in_flight: usize,
    /// Blocks downloaded and stored.
    pub completed: u64,
    /// Failed download attempts.
    pub failed: u64,
    /// Stalls detected.
    pub stalls: u64,
}

/// Fired after a downloaded block is stored as pending.
pub type NewBlockAvailableCallback = Arc<dyn Fn() + Send + Sync>;

struct InFlight {
    attempt: u64,
    pending_id: PendingBlockId,
    started: Instant,
}

struct DownloaderShared {
    config: DownloadConfig,
    manager: Arc<NodeManager>,
    store: Arc<dyn BlockStore>,
    /// Hash -> in-flight attempt. A hash is never present twice.
    in_flight: Mutex<HashMap<Sha256Hash, InFlight>>,
    next_attempt: AtomicU64,
    slot_released: Notify,
    callback: RwLock<Option<NewBlockAvailableCallback>>,
    last_genesis_attempt: Mutex<Option<Instant>>,
    stats: Mutex<DownloadStats>,
}

/// Assigns pending blocks to peers under the concurrency budget.
pub struct BlockDownloader {
    shared: Arc<DownloaderShared>,
}

impl BlockDownloader {
    /// Create a downloader.
    pub fn new(
        config: DownloadConfig,
        manager: Arc<NodeManager>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            shared: Arc::new(DownloaderShared {
                config,
                manager,
                store,
                in_flight: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(1),
                slot_released: Notify::new(),
                callback: RwLock::new(None),
                last_genesis_attempt: Mutex::new(None),
                stats: Mutex::new(DownloadStats::default()),
            }),
        }
    }

    /// Set the callback fired when a downloaded block is stored.
    pub fn set_new_block_available_callback(&self, callback: NewBlockAvailableCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    /// Budget for the current peer count.
    pub fn current_budget(&self) -> usize {
        concurrency_budget(
            self.shared.manager.active_node_count(),
            self.shared.config.max_concurrent_downloads,
        )
    }

    /// Number of downloads in flight.
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Hashes being downloaded.
    pub fn in_flight_hashes(&self) -> Vec<Sha256Hash> {
        self.shared.in_flight.lock().keys().copied().collect()
    }

    /// Download statistics.
    pub fn stats(&self) -> DownloadStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.in_flight = self.in_flight_count();
        stats
    }

    /// Wait until the in-flight count drops below `budget`.
    ///
    /// Returns `false` on a stall, after failing every in-flight download.
    async fn wait_for_slot(&self, budget: usize) -> bool {
        let deadline = Instant::now() + self.shared.config.stall_timeout;
        loop {
            let released = self.shared.slot_released.notified();
            if self.shared.in_flight.lock().len() < budget {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                self.shared.on_stall();
                return false;
            }
        }
    }

    fn check_genesis(&self, budget: usize) {
        let shared = &self.shared;
        match shared.store.has_block_data(&GENESIS_BLOCK_HASH) {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!(error = %e, "Failed to check for genesis block");
                return;
            }
        }

        {
            let mut last = shared.last_genesis_attempt.lock();
            if (*last).is_some_and(|at| at.elapsed() <= shared.config.genesis_retry_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let pending_id = match shared.store.get_or_create(&GENESIS_BLOCK_HASH) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to create genesis pending block");
                return;
            }
        };
        if shared.store.has_payload(pending_id).unwrap_or(false) {
            return;
        }
        if let Some(attempt) = shared.reserve(GENESIS_BLOCK_HASH, pending_id, budget) {
            info!("Requesting genesis block");
            self.start_download(GENESIS_BLOCK_HASH, pending_id, None, attempt);
        }
    }

    fn start_download(
        &self,
        hash: Sha256Hash,
        pending_id: PendingBlockId,
        peer: Option<PeerId>,
        attempt: u64,
    ) {
        if let Err(e) = self.shared.store.update_last_download_attempt(pending_id) {
            warn!(hash = %hash, error = %e, "Failed to stamp download attempt");
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let manager = &shared.manager;
            let result = if shared.config.thin_blocks_enabled && manager.thin_blocks_worthwhile() {
                manager.request_thin_block(hash, peer).await
            } else {
                manager.request_block(hash, peer).await
            };
            shared.on_download_complete(hash, attempt, result);
        });
    }
}

impl DownloaderShared {
    /// Reserve a slot for `hash`. `None` if it is already in flight or the
    /// budget is used up.
    fn reserve(&self, hash: Sha256Hash, pending_id: PendingBlockId, budget: usize) -> Option<u64> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&hash) || in_flight.len() >= budget {
            return None;
        }
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(
            hash,
            InFlight {
                attempt,
                pending_id,
                started: Instant::now(),
            },
        );
        Some(attempt)
    }

    fn on_download_complete(
        &self,
        hash: Sha256Hash,
        attempt: u64,
        result: Result<Block, RequestError>,
    ) {
        let released = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&hash) {
                Some(entry) if entry.attempt == attempt => in_flight.remove(&hash),
                _ => None,
            }
        };

        match result {
            Ok(block) => {
                match self.store.store(&block) {
                    Ok(_) => {
                        self.stats.lock().completed += 1;
                        debug!(
                            hash = %hash,
                            elapsed_ms = released
                                .as_ref()
                                .map(|entry| entry.started.elapsed().as_millis() as u64)
                                .unwrap_or(0),
                            "Downloaded block"
                        );
                        let callback = self.callback.read().clone();
                        if let Some(callback) = callback {
                            callback();
                        }
                    }
                    Err(e) => warn!(hash = %hash, error = %e, "Failed to store downloaded block"),
                }
            }
            Err(e) => {
                // A stall already counted this attempt.
                if let Some(entry) = &released {
                    debug!(hash = %hash, error = %e, "Block download failed");
                    self.record_failure(hash, entry.pending_id);
                }
            }
        }

        self.slot_released.notify_waiters();
    }

    fn record_failure(&self, hash: Sha256Hash, pending_id: PendingBlockId) {
        self.stats.lock().failed += 1;
        let count = match self.store.increment_failure_count(pending_id) {
            Ok(count) => count,
            Err(e) => {
                debug!(hash = %hash, error = %e, "Failed to count download failure");
                return;
            }
        };
        if count > self.config.max_failure_count {
            match self.store.purge_failed(self.config.max_failure_count) {
                Ok(purged) => info!(hash = %hash, purged, "Purged failed pending blocks"),
                Err(e) => warn!(error = %e, "Failed to purge failed pending blocks"),
            }
        }
    }

    fn on_stall(&self) {
        let stalled: Vec<(Sha256Hash, InFlight)> = self.in_flight.lock().drain().collect();
        warn!(count = stalled.len(), "Block downloads stalled");
        self.stats.lock().stalls += 1;
        for (hash, entry) in stalled {
            self.record_failure(hash, entry.pending_id);
        }
        self.slot_released.notify_waiters();
    }
}

impl SleepyWorker for BlockDownloader {
    fn name(&self) -> &'static str {
        "block-downloader"
    }

    async fn run_cycle(&self) -> bool {
        let budget = self.current_budget();
        if !self.wait_for_slot(budget).await {
            return false;
        }

        let nodes = self.shared.manager.connected_node_ids();
        if nodes.is_empty() {
            return false;
        }
        self.check_genesis(budget);

        let store = &self.shared.store;
        if let Err(e) = store.cleanup() {
            warn!(error = %e, "Failed to clean up pending blocks");
        }

        let node_ids: Vec<NodeId> = nodes.iter().map(|(id, _)| *id).collect();
        let peers: HashMap<NodeId, PeerId> = nodes.into_iter().collect();
        let plan = match store.select_assignment_plan(&node_ids, budget * 2) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Failed to plan downloads");
                return false;
            }
        };

        let mut started = 0usize;
        for (pending_id, node_id) in plan {
            let hash = match store.pending_block_hash(pending_id) {
                Ok(Some(hash)) => hash,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pending = %pending_id, error = %e, "Failed to load pending block");
                    continue;
                }
            };
            let Some(attempt) = self.shared.reserve(hash, pending_id, budget) else {
                continue;
            };
            self.start_download(hash, pending_id, peers.get(&node_id).copied(), attempt);
            started += 1;
        }

        if started > 0 {
            debug!(started, budget, "Scheduled block downloads");
        }
        started > 0
    }

    async fn on_sleep(&self) {
        let nodes = self.shared.manager.connected_node_ids();
        if nodes.is_empty() {
            return;
        }
        self.shared.manager.find_node_inventory();

        let node_ids: Vec<NodeId> = nodes.into_iter().map(|(id, _)| id).collect();
        match self.shared.store.purge_unlocatable(&node_ids) {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged unlocatable pending blocks"),
            Err(e) => warn!(error = %e, "Failed to purge unlocatable pending blocks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_budget() {
        assert_eq!(concurrency_budget(0, MAX_CONCURRENT_DOWNLOADS), 1);
        assert_eq!(concurrency_budget(1, MAX_CONCURRENT_DOWNLOADS), 4);
        assert_eq!(concurrency_budget(5, MAX_CONCURRENT_DOWNLOADS), 16);
        assert_eq!(concurrency_budget(6, MAX_CONCURRENT_DOWNLOADS), 19);
        assert_eq!(concurrency_budget(7, MAX_CONCURRENT_DOWNLOADS), 21);
        assert_eq!(concurrency_budget(100, MAX_CONCURRENT_DOWNLOADS), 21);
    }

    #[test]
    fn test_default_config() {
        let config = DownloadConfig::default();
        assert_eq!(config.max_concurrent_downloads, 21);
        assert_eq!(config.stall_timeout, Duration::from_secs(90));
        assert_eq!(config.genesis_retry_interval, Duration::from_secs(30));
        assert_eq!(config.max_failure_count, MAX_DOWNLOAD_FAILURE_COUNT);
    }
}
