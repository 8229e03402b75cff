//! # btc-network
//!
//! Peer-facing half of the synchronization core.
//!
//! This crate provides:
//! - Peer registry and connection manager with ban enforcement
//! - Request/response correlation with per-request deadlines
//! - Thin block reconciliation with full-block fallback
//! - Peer scoring and penalties
//! - Decoded protocol messages and the transport seam
//! - Block locator construction

mod ban;
pub mod correlator;
mod error;
mod locator;
mod manager;
mod message;
mod peer;
mod penalties;
mod scoring;
mod status;
pub mod thin;
mod transport;

pub use ban::{BanFilter, BanPolicy, FailedConnectionBanFilter, FAILED_CONNECTION_ATTEMPT_COUNT};
pub use correlator::{Expectation, RequestCorrelator, RequestId, RequestTicket, Response};
pub use error::{NetworkError, NetworkResult, RequestError};
pub use locator::block_finder_hashes;
pub use manager::{
    AddNodeOutcome, InventoryCallback, ManagerCollaborators, ManagerConfig, NodeManager,
    MINIMUM_THIN_BLOCK_TRANSACTION_COUNT,
};
pub use message::{Message, QueryBlocks, ThinBlock, MAX_BLOCK_HASH_COUNT};
pub use peer::{HandshakeInfo, PeerId, PeerNode, PeerState};
pub use penalties::{Penalties, PenaltyReason, Rewards};
pub use scoring::PeerScore;
pub use status::{EmptyMemoryPool, MemoryPoolEnquirer, SynchronizationStatus};
pub use thin::{
    Assembly, ThinBlockAction, ThinBlockAssembler, ThinBlockAssembly, ThinBlockEvent,
    ThinBlockReconciliation, ThinBlockState,
};
pub use transport::{ChannelTransport, NetworkCommand, PeerTransport};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 8333;
