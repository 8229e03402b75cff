//! Node service feature flags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single advertised service bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum NodeFeature {
    /// Serves the full block chain.
    BlockchainEnabled = 0x01,
    /// Answers UTXO queries.
    GetUtxoEnabled = 0x02,
    /// Accepts bloom-filtered connections.
    BloomConnectionsEnabled = 0x04,
    /// Speaks the xthin (thin block) protocol.
    XthinProtocolEnabled = 0x10,
    /// Follows the Bitcoin Cash chain.
    BitcoinCashEnabled = 0x20,
}

impl NodeFeature {
    /// Bit value of this feature.
    pub fn bit(self) -> u64 {
        self as u64
    }
}

/// A set of service bits as advertised in a version handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFeatures(u64);

impl NodeFeatures {
    /// No features.
    pub const NONE: NodeFeatures = NodeFeatures(0);

    /// Wrap raw service bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw service bits.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Combine multiple features.
    pub fn of(features: &[NodeFeature]) -> Self {
        Self(features.iter().fold(0u64, |acc, f| acc | f.bit()))
    }

    /// Whether a single feature is set.
    pub fn has(&self, feature: NodeFeature) -> bool {
        (self.0 & feature.bit()) != 0
    }

    /// Whether every feature in `required` is set.
    pub fn contains(&self, required: NodeFeatures) -> bool {
        (self.0 & required.0) == required.0
    }

    /// Set a feature.
    pub fn with(self, feature: NodeFeature) -> Self {
        Self(self.0 | feature.bit())
    }

    /// Union of two sets.
    pub fn union(self, other: NodeFeatures) -> Self {
        Self(self.0 | other.0)
    }

    /// Features required of peers that the node falls back to when all are lost.
    pub fn full_node() -> Self {
        Self::of(&[NodeFeature::BlockchainEnabled, NodeFeature::BitcoinCashEnabled])
    }
}

impl fmt::Display for NodeFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
