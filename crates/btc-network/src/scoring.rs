//! Peer scoring used to rank peers for outbound requests.

use crate::penalties::{Penalties, PenaltyReason, Rewards};
use std::time::Duration;
use tokio::time::Instant;

/// Responses slower than this earn a [`PenaltyReason::SlowResponse`].
const SLOW_RESPONSE: Duration = Duration::from_secs(10);

/// Per-peer request statistics and decaying penalty.
#[derive(Debug, Clone)]
pub struct PeerScore {
    penalty: u32,
    last_penalty_time: Instant,
    /// Exponential moving average, alpha = 1/8.
    avg_response_time_ms: u64,
    response_count: u64,
    delivered_count: u64,
    failed_count: u64,
    reward_score: i32,
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScore {
    /// A neutral score.
    pub fn new() -> Self {
        Self {
            penalty: 0,
            last_penalty_time: Instant::now(),
            avg_response_time_ms: 0,
            response_count: 0,
            delivered_count: 0,
            failed_count: 0,
            reward_score: 0,
        }
    }

    /// Penalty after decay.
    pub fn current_penalty(&self) -> u32 {
        self.penalty_after(self.last_penalty_time.elapsed())
    }

    fn penalty_after(&self, elapsed: Duration) -> u32 {
        let minutes = elapsed.as_secs() / 60;
        let decay = (minutes as u32).saturating_mul(Penalties::DECAY_PER_MINUTE);
        self.penalty.saturating_sub(decay)
    }

    /// Apply a penalty. Returns `true` once the peer should be banned.
    pub fn apply_penalty(&mut self, reason: PenaltyReason) -> bool {
        self.penalty = self
            .current_penalty()
            .saturating_add(reason.penalty())
            .min(Penalties::MAX_PENALTY);
        self.last_penalty_time = Instant::now();
        self.should_ban()
    }

    /// Whether the decayed penalty has reached the ban threshold.
    pub fn should_ban(&self) -> bool {
        self.current_penalty() >= Penalties::BAN_THRESHOLD
    }

    /// Record a successful reply and how long it took.
    ///
    /// Returns `true` if the slow-response penalty tipped the peer over the
    /// ban threshold.
    pub fn record_delivery(&mut self, elapsed: Duration) -> bool {
        self.delivered_count += 1;
        self.reward_score =
            (self.reward_score + Rewards::SUCCESSFUL_DELIVERY).min(Rewards::MAX_SCORE);

        let millis = elapsed.as_millis() as u64;
        self.avg_response_time_ms = if self.response_count == 0 {
            millis
        } else {
            (self.avg_response_time_ms * 7 + millis) / 8
        };
        self.response_count += 1;

        elapsed >= SLOW_RESPONSE && self.apply_penalty(PenaltyReason::SlowResponse)
    }

    /// Record a request the peer did not satisfy.
    pub fn record_failure(&mut self) {
        self.failed_count += 1;
    }

    /// Ranking value in `[0, 1]`; higher is better.
    pub fn priority(&self) -> f64 {
        let response = if self.response_count == 0 {
            0.5
        } else {
            1.0 / (1.0 + self.avg_response_time_ms as f64 / 1000.0)
        };

        let total = self.delivered_count + self.failed_count;
        let reliability = if total == 0 {
            0.5
        } else {
            self.delivered_count as f64 / total as f64
        };

        let penalty = 1.0 - self.current_penalty() as f64 / Penalties::MAX_PENALTY as f64;
        let reward = 0.5 + self.reward_score.max(0) as f64 / Rewards::MAX_SCORE as f64 * 0.5;

        (reliability * 0.4 + response * 0.3 + penalty * 0.2 + reward * 0.1).clamp(0.0, 1.0)
    }

    /// Average response time in milliseconds.
    pub fn avg_response_time(&self) -> u64 {
        self.avg_response_time_ms
    }

    /// Successful replies.
    pub fn delivered_count(&self) -> u64 {
        self.delivered_count
    }

    /// Failed requests.
    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }
}
