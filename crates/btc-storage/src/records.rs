//! Identifiers and stored records.

use btc_types::{NodeFeatures, Sha256Hash};
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Instant, SystemTime};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Row id of a pending block record.
    PendingBlockId
);
record_id!(
    /// Row id of a stored header (and its block, once downloaded).
    BlockId
);
record_id!(
    /// Id of one fork's contiguous run of headers.
    BlockchainSegmentId
);
record_id!(
    /// Persisted identity of a peer address.
    NodeId
);

/// Bookkeeping between peer download and chain assembly.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    /// Row id.
    pub id: PendingBlockId,
    /// Block hash.
    pub hash: Sha256Hash,
    /// Parent hash, known once a header or payload arrives.
    pub previous_hash: Option<Sha256Hash>,
    /// Raw block payload, absent until downloaded.
    pub data: Option<Bytes>,
    /// Number of failed download attempts.
    pub failed_download_count: u32,
    /// When a download was last attempted.
    pub last_download_attempt: Option<Instant>,
    /// Lower is sooner.
    pub priority: u64,
}

impl PendingBlock {
    /// Whether the payload has been downloaded.
    pub fn has_payload(&self) -> bool {
        self.data.is_some()
    }
}

/// Persisted metadata about a peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Resolved IP.
    pub ip: IpAddr,
    /// Port.
    pub port: u16,
    /// Service bits from the last handshake.
    pub features: NodeFeatures,
    /// User agent from the last handshake.
    pub user_agent: Option<String>,
    /// Time of the last completed handshake.
    pub last_handshake: Option<SystemTime>,
}

impl PeerRecord {
    /// A record for an address that has not completed a handshake.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            features: NodeFeatures::NONE,
            user_agent: None,
            last_handshake: None,
        }
    }

    /// Socket address.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// A `QueryBlocks` plan entry: ask peers for inventory after `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryQuery {
    /// Hash to query from.
    pub start: Sha256Hash,
    /// Stop before this hash; `None` asks for as much as the peer has.
    pub stop_before: Option<Sha256Hash>,
}
