//! Bitcoin synchronization node.
//!
//! Entry point for the btc-node binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Bitcoin block synchronization node.
#[derive(Parser, Debug)]
#[command(name = "btc-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "btc-node.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum number of peers to re-dial after losing every connection
    #[arg(long)]
    max_peers: Option<usize>,

    /// Additional peer to connect to (repeatable)
    #[arg(long = "connect")]
    connect: Vec<String>,

    /// Always download full blocks
    #[arg(long)]
    no_thin_blocks: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting btc-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;

    if args.write_config {
        config.save(&args.config)?;
        info!("Configuration written to {:?}", args.config);
        return Ok(());
    }

    info!("Known peers: {}", config.network.known_peers.len());
    info!(
        "Thin blocks: {}",
        if config.sync.thin_blocks_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    let node = Node::new(config)?;

    let node_handle = node.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        node_handle.shutdown().await;
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown complete");
        }
    }

    info!("btc-node stopped");
    Ok(())
}
