//! Penalty definitions for misbehaving peers.
//!
//! Penalties accumulate on a peer's score and decay over time. A peer whose
//! penalty reaches [`Penalties::BAN_THRESHOLD`] is banned by IP.

/// Penalty amounts.
pub struct Penalties;

impl Penalties {
    /// Reply arrived, but slowly.
    pub const SLOW_RESPONSE: u32 = 2;

    /// Peer answered `NotFound` for data it was asked for.
    pub const NOT_FOUND: u32 = 5;

    /// Message that matched no outstanding request.
    pub const UNSOLICITED_MESSAGE: u32 = 5;

    /// No reply before the request deadline.
    pub const REQUEST_TIMEOUT: u32 = 20;

    /// Reply that did not match the request (wrong hash, bad merkle root).
    pub const INVALID_RESPONSE: u32 = 50;

    /// Penalty at which the peer's IP is banned.
    pub const BAN_THRESHOLD: u32 = 100;

    /// Penalty decay per minute.
    pub const DECAY_PER_MINUTE: u32 = 5;

    /// Saturation cap.
    pub const MAX_PENALTY: u32 = 200;
}

/// Reward amounts.
pub struct Rewards;

impl Rewards {
    /// Delivered what was requested.
    pub const SUCCESSFUL_DELIVERY: i32 = 1;

    /// Cap on accumulated rewards.
    pub const MAX_SCORE: i32 = 50;
}

/// Penalty reason for logging and scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    SlowResponse,
    NotFound,
    UnsolicitedMessage,
    RequestTimeout,
    InvalidResponse,
}

impl PenaltyReason {
    /// Penalty amount for this reason.
    pub fn penalty(&self) -> u32 {
        match self {
            Self::SlowResponse => Penalties::SLOW_RESPONSE,
            Self::NotFound => Penalties::NOT_FOUND,
            Self::UnsolicitedMessage => Penalties::UNSOLICITED_MESSAGE,
            Self::RequestTimeout => Penalties::REQUEST_TIMEOUT,
            Self::InvalidResponse => Penalties::INVALID_RESPONSE,
        }
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::SlowResponse => "slow response",
            Self::NotFound => "not found",
            Self::UnsolicitedMessage => "unsolicited message",
            Self::RequestTimeout => "request timeout",
            Self::InvalidResponse => "invalid response",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_ban_after_repeats() {
        let timeouts_to_ban = Penalties::BAN_THRESHOLD.div_ceil(Penalties::REQUEST_TIMEOUT);
        assert_eq!(timeouts_to_ban, 5);
        assert!(PenaltyReason::InvalidResponse.penalty() < Penalties::BAN_THRESHOLD);
    }
}
