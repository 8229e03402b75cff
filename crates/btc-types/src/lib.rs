//! # btc-types
//!
//! Chain primitives used by the synchronization core.
//!
//! This crate provides:
//! - Double SHA-256 hashes in display byte order
//! - 80-byte block headers and their hashing
//! - Opaque transactions and blocks with merkle root calculation
//! - The pending-block payload codec
//! - Node service feature flags and mempool bloom filters

mod block;
mod bloom;
mod error;
mod features;
mod genesis;
mod hash;
mod header;
mod transaction;

pub use block::{Block, BlockHeaderWithTransactionCount};
pub use bloom::BloomFilter;
pub use error::{DecodeError, DecodeResult};
pub use features::{NodeFeature, NodeFeatures};
pub use genesis::{genesis_block, genesis_header};
pub use hash::{double_sha256, Sha256Hash};
pub use header::{BlockHeader, GENESIS_BLOCK_HASH};
pub use transaction::Transaction;

/// Size of a serialized block header.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Upper bound on a decoded block payload.
pub const MAX_BLOCK_SIZE: usize = 32 * 1024 * 1024; // 32 MB
