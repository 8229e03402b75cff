//! # btc-sync
//!
//! Block synchronization workers.
//!
//! This crate provides:
//! - The sleepy worker runtime shared by every long-running component
//! - Block download scheduling under a peer-derived concurrency budget
//! - Ordered, failure-tolerant chain assembly from pending blocks
//! - Chain synchronization status and the block processor seam

mod builder;
mod download;
mod error;
mod processor;
mod requester;
mod status;
mod worker;

pub use builder::{BlockchainBuilder, BuilderConfig, NewBlockProcessedCallback};
pub use download::{
    concurrency_budget, BlockDownloader, DownloadConfig, DownloadStats,
    NewBlockAvailableCallback, MAX_CONCURRENT_DOWNLOADS, MAX_DOWNLOAD_FAILURE_COUNT,
};
pub use error::{SyncError, SyncResult};
pub use processor::{BlockProcessor, ChainStoreProcessor};
pub use requester::BlockDownloadRequester;
pub use status::ChainSynchronizationStatus;
pub use worker::{SleepyWorker, StatusMonitor, WorkerHandle, WorkerStatus};

use std::time::Duration;

/// Sleep period of the block downloader.
pub const DOWNLOADER_SLEEP_PERIOD: Duration = Duration::from_secs(10);

/// Sleep period of the blockchain builder.
pub const BUILDER_SLEEP_PERIOD: Duration = Duration::from_secs(5);
