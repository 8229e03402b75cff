//! Peer identity and per-peer state.

use crate::scoring::PeerScore;
use btc_storage::PeerRecord;
use btc_types::{NodeFeature, NodeFeatures};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::time::Instant;

/// Runtime peer identity: the resolved socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(SocketAddr);

impl PeerId {
    /// Create from a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Socket address.
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// IP address.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Not connected.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Connected, version handshake in progress.
    Handshaking,
    /// Handshake complete and accepted.
    Active,
    /// Refused because its IP is banned.
    Banned,
}

/// What a peer declared in its version handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Advertised service bits.
    pub features: NodeFeatures,
    /// User agent string.
    pub user_agent: Option<String>,
    /// Whether the peer asked for new blocks to be announced by header.
    pub prefers_header_announcements: bool,
}

/// A peer owned by the connection manager.
#[derive(Debug, Clone)]
pub struct PeerNode {
    /// Identity.
    pub id: PeerId,
    /// Connection state.
    pub state: PeerState,
    /// Advertised features (empty until the handshake completes).
    pub features: NodeFeatures,
    /// User agent.
    pub user_agent: Option<String>,
    /// Whether the version handshake completed.
    pub handshake_complete: bool,
    /// Announce new blocks with headers rather than hashes.
    pub prefers_header_announcements: bool,
    /// Last time any message arrived.
    pub last_message: Option<Instant>,
    /// Request statistics.
    pub score: PeerScore,
}

impl PeerNode {
    /// A peer that is being dialed.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: PeerId::new(addr),
            state: PeerState::Connecting,
            features: NodeFeatures::NONE,
            user_agent: None,
            handshake_complete: false,
            prefers_header_announcements: false,
            last_message: None,
            score: PeerScore::new(),
        }
    }

    /// IP address.
    pub fn ip(&self) -> IpAddr {
        self.id.ip()
    }

    /// Whether the peer advertised `feature`.
    pub fn has_feature(&self, feature: NodeFeature) -> bool {
        self.features.has(feature)
    }

    /// Whether the peer can serve thin blocks.
    pub fn supports_thin_blocks(&self) -> bool {
        self.has_feature(NodeFeature::XthinProtocolEnabled)
    }

    /// Apply the fields of a completed handshake.
    pub fn complete_handshake(&mut self, info: &HandshakeInfo) {
        self.features = info.features;
        self.user_agent = info.user_agent.clone();
        self.prefers_header_announcements = info.prefers_header_announcements;
        self.handshake_complete = true;
    }

    /// Persistable view of this peer.
    pub fn to_record(&self) -> PeerRecord {
        let mut record = PeerRecord::new(self.id.addr());
        record.features = self.features;
        record.user_agent = self.user_agent.clone();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_addr() {
        let addr: SocketAddr = "192.168.1.7:8333".parse().unwrap();
        let id = PeerId::from(addr);
        assert_eq!(id.ip(), addr.ip());
        assert_eq!(id.port(), 8333);
        assert_eq!(id.to_string(), "192.168.1.7:8333");
    }

    #[test]
    fn test_handshake_updates_node() {
        let mut node = PeerNode::new("10.1.1.1:8333".parse().unwrap());
        assert!(!node.handshake_complete);
        assert!(!node.supports_thin_blocks());

        node.complete_handshake(&HandshakeInfo {
            features: NodeFeatures::of(&[
                NodeFeature::BlockchainEnabled,
                NodeFeature::XthinProtocolEnabled,
            ]),
            user_agent: Some("/test:0.1/".to_string()),
            prefers_header_announcements: true,
        });

        assert!(node.handshake_complete);
        assert!(node.supports_thin_blocks());
        let record = node.to_record();
        assert_eq!(record.user_agent.as_deref(), Some("/test:0.1/"));
        assert_eq!(record.port, 8333);
    }
}
