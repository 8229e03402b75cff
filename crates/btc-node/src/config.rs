//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use btc_network::{
    BanPolicy, ManagerConfig, DEFAULT_PORT, FAILED_CONNECTION_ATTEMPT_COUNT,
    MINIMUM_THIN_BLOCK_TRANSACTION_COUNT,
};
use btc_sync::{
    BuilderConfig, DownloadConfig, BUILDER_SLEEP_PERIOD, DOWNLOADER_SLEEP_PERIOD,
    MAX_CONCURRENT_DOWNLOADS, MAX_DOWNLOAD_FAILURE_COUNT,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer management.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Block synchronization.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Peer management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Peers dialed at startup.
    pub known_peers: Vec<String>,
    /// Peers re-dialed when every connection is lost.
    pub max_node_count: usize,
    /// Lifetime of a request to a peer, in seconds.
    pub request_timeout_secs: u64,
    /// Failed connections that get an address banned.
    pub ban_failed_connection_threshold: usize,
    /// Window the failures are counted over, in seconds.
    pub ban_window_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            known_peers: Vec::new(),
            max_node_count: 8,
            request_timeout_secs: 30,
            ban_failed_connection_threshold: FAILED_CONNECTION_ATTEMPT_COUNT,
            ban_window_secs: 60,
        }
    }
}

/// Block synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_concurrent_downloads: usize,
    pub stall_timeout_secs: u64,
    pub genesis_retry_interval_secs: u64,
    pub max_download_failure_count: u32,
    pub thin_blocks_enabled: bool,
    /// Mempool size required before thin blocks are attempted.
    pub minimum_thin_block_transaction_count: usize,
    pub max_blocks_per_cycle: usize,
    pub downloader_sleep_secs: u64,
    pub builder_sleep_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: MAX_CONCURRENT_DOWNLOADS,
            stall_timeout_secs: 90,
            genesis_retry_interval_secs: 30,
            max_download_failure_count: MAX_DOWNLOAD_FAILURE_COUNT,
            thin_blocks_enabled: true,
            minimum_thin_block_transaction_count: MINIMUM_THIN_BLOCK_TRANSACTION_COUNT,
            max_blocks_per_cycle: 1_000,
            downloader_sleep_secs: DOWNLOADER_SLEEP_PERIOD.as_secs(),
            builder_sleep_secs: BUILDER_SLEEP_PERIOD.as_secs(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        if let Some(max_peers) = args.max_peers {
            config.network.max_node_count = max_peers;
        }
        for peer in &args.connect {
            if !config.network.known_peers.contains(peer) {
                config.network.known_peers.push(peer.clone());
            }
        }
        if args.no_thin_blocks {
            config.sync.thin_blocks_enabled = false;
        }

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Known peers that parse as addresses. A bare IP gets the default port.
    pub fn known_peer_addrs(&self) -> Vec<SocketAddr> {
        self.network
            .known_peers
            .iter()
            .filter_map(|peer| {
                if let Ok(addr) = peer.parse::<SocketAddr>() {
                    return Some(addr);
                }
                match peer.parse::<IpAddr>() {
                    Ok(ip) => Some(SocketAddr::new(ip, DEFAULT_PORT)),
                    Err(_) => {
                        warn!(peer = %peer, "Ignoring invalid peer address");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_node_count: self.network.max_node_count,
            request_timeout: Duration::from_secs(self.network.request_timeout_secs),
            minimum_thin_block_transaction_count: self.sync.minimum_thin_block_transaction_count,
            ..Default::default()
        }
    }

    pub fn ban_policy(&self) -> BanPolicy {
        BanPolicy {
            failed_connection_threshold: self.network.ban_failed_connection_threshold,
            window: Duration::from_secs(self.network.ban_window_secs),
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_concurrent_downloads: self.sync.max_concurrent_downloads,
            stall_timeout: Duration::from_secs(self.sync.stall_timeout_secs),
            genesis_retry_interval: Duration::from_secs(self.sync.genesis_retry_interval_secs),
            max_failure_count: self.sync.max_download_failure_count,
            thin_blocks_enabled: self.sync.thin_blocks_enabled,
        }
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            max_blocks_per_cycle: self.sync.max_blocks_per_cycle,
            ..Default::default()
        }
    }

    pub fn downloader_sleep_period(&self) -> Duration {
        Duration::from_secs(self.sync.downloader_sleep_secs)
    }

    pub fn builder_sleep_period(&self) -> Duration {
        Duration::from_secs(self.sync.builder_sleep_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["btc-node"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network.max_node_count, 8);
        assert_eq!(config.sync.max_concurrent_downloads, 21);
        assert_eq!(config.sync.stall_timeout_secs, 90);
        assert!(config.sync.thin_blocks_enabled);
        assert_eq!(config.download_config().max_failure_count, 10);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.toml"), &args(&[])).unwrap();
        assert!(config.network.known_peers.is_empty());
        assert_eq!(config.sync.genesis_retry_interval_secs, 30);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc-node.toml");
        std::fs::write(
            &path,
            "[network]\nknown_peers = [\"10.0.0.1:8333\"]\n\n[sync]\nstall_timeout_secs = 45\n",
        )
        .unwrap();

        let config = NodeConfig::load(&path, &args(&[])).unwrap();
        assert_eq!(config.network.known_peers, vec!["10.0.0.1:8333".to_string()]);
        assert_eq!(config.network.max_node_count, 8);
        assert_eq!(config.download_config().stall_timeout, Duration::from_secs(45));
        assert_eq!(config.sync.max_concurrent_downloads, 21);
    }

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc-node.toml");
        std::fs::write(&path, "[network]\nknown_peers = [\"10.0.0.1:8333\"]\n").unwrap();

        let config = NodeConfig::load(
            &path,
            &args(&[
                "--max-peers",
                "3",
                "--connect",
                "10.0.0.2:8333",
                "--connect",
                "10.0.0.1:8333",
                "--no-thin-blocks",
            ]),
        )
        .unwrap();

        assert_eq!(config.manager_config().max_node_count, 3);
        assert_eq!(config.network.known_peers.len(), 2);
        assert!(!config.download_config().thin_blocks_enabled);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc-node.toml");
        std::fs::write(&path, "[network\nmax_node_count = ").unwrap();
        assert!(NodeConfig::load(&path, &args(&[])).is_err());
    }

    #[test]
    fn test_invalid_peer_addresses_are_skipped() {
        let mut config = NodeConfig::default();
        config.network.known_peers = vec![
            "10.0.0.1:18333".into(),
            "not-an-address".into(),
            "10.0.0.2".into(),
        ];
        let addrs = config.known_peer_addrs();
        assert_eq!(
            addrs,
            vec![
                "10.0.0.1:18333".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:8333".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc-node.toml");
        let mut config = NodeConfig::default();
        config.sync.max_blocks_per_cycle = 250;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path, &args(&[])).unwrap();
        assert_eq!(loaded.builder_config().max_blocks_per_cycle, 250);
    }
}
