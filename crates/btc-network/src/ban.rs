//! Ban heuristics for peers that never complete a handshake.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Failed connection attempts within the window that trigger a ban.
pub const FAILED_CONNECTION_ATTEMPT_COUNT: usize = 3;

/// Decides which peer IPs should be refused.
///
/// Persistence of the ban itself belongs to the peer store; a filter only
/// tracks the evidence.
pub trait BanFilter: Send + Sync {
    /// Note that a peer from `ip` disconnected before its handshake completed.
    fn record_failed_connection(&self, ip: IpAddr);

    /// Whether `ip` has earned a ban.
    fn should_ban_ip(&self, ip: IpAddr) -> bool;

    /// Forget the evidence against `ip` (on unban).
    fn clear(&self, ip: IpAddr);
}

/// Thresholds for [`FailedConnectionBanFilter`].
#[derive(Debug, Clone)]
pub struct BanPolicy {
    /// Failures within `window` that trigger a ban.
    pub failed_connection_threshold: usize,
    /// Sliding window.
    pub window: Duration,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            failed_connection_threshold: FAILED_CONNECTION_ATTEMPT_COUNT,
            window: Duration::from_secs(60),
        }
    }
}

/// Bans an IP after repeated failed connections within a sliding window.
#[derive(Debug, Default)]
pub struct FailedConnectionBanFilter {
    policy: BanPolicy,
    attempts: DashMap<IpAddr, VecDeque<Instant>>,
}

impl FailedConnectionBanFilter {
    /// Create a filter with the given policy.
    pub fn new(policy: BanPolicy) -> Self {
        Self {
            policy,
            attempts: DashMap::new(),
        }
    }

    fn prune(&self, attempts: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = attempts.front() {
            if now.duration_since(*oldest) > self.policy.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

impl BanFilter for FailedConnectionBanFilter {
    fn record_failed_connection(&self, ip: IpAddr) {
        let now = Instant::now();
        let count = {
            let mut attempts = self.attempts.entry(ip).or_default();
            self.prune(&mut attempts, now);
            attempts.push_back(now);
            attempts.len()
        };
        // Drop other IPs whose evidence has fully expired.
        self.attempts.retain(|_, attempts| {
            self.prune(attempts, now);
            !attempts.is_empty()
        });
        debug!(ip = %ip, count, "Recorded failed connection");
    }

    fn should_ban_ip(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let count = match self.attempts.get_mut(&ip) {
            Some(mut attempts) => {
                self.prune(&mut attempts, now);
                attempts.len()
            }
            None => return false,
        };
        if count == 0 {
            self.attempts.remove_if(&ip, |_, attempts| attempts.is_empty());
        }
        count >= self.policy.failed_connection_threshold
    }

    fn clear(&self, ip: IpAddr) {
        self.attempts.remove(&ip);
    }
}
