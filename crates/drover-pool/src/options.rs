//! Pool tuning knobs.

use std::time::Duration;

/// Tuning for growth polling and congestion thresholds.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Delay between observed-state refreshes while growing.
    pub poll_interval: Duration,
    /// Bounded number of refresh rounds a growth call may spend.
    pub poll_attempts: u32,
    /// Simultaneously Pending submissions the congestion-avoiding policy
    /// tolerates before parking the remainder.
    pub pending_limit: usize,
    /// Simultaneously re-Pending workers restart-before-expiry may create.
    pub restart_pending_cap: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_attempts: 20,
            pending_limit: 2,
            restart_pending_cap: 2,
        }
    }
}

impl PoolOptions {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts;
        self
    }

    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    pub fn with_restart_pending_cap(mut self, cap: usize) -> Self {
        self.restart_pending_cap = cap;
        self
    }
}
