//! Configuration for master-density rebalancing.

use crate::error::{Error, Result};
use std::time::Duration;

/// Configuration for the master balancing layer on one node.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Whether rebalancing runs at all. When false the disabled variant is
    /// built and the node never participates.
    pub enabled: bool,

    /// How long the control loop waits for a notification before
    /// re-evaluating density anyway.
    pub poll_interval: Duration,

    /// Capacity of the role-change notification queue.
    pub queue_capacity: usize,

    /// How long `note_state` blocks on a full queue before logging and
    /// retrying.
    pub enqueue_timeout: Duration,

    /// Lifetime of master leases.
    pub lease_duration: Duration,

    /// Upper bound on the shutdown drain wait.
    pub drain_timeout: Duration,

    /// How often the drain checks for outstanding leases.
    pub drain_poll_interval: Duration,

    /// Timeout for one remote call over the TCP contract.
    pub rpc_timeout: Duration,

    /// Largest frame accepted on the TCP contract.
    pub max_message_size: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(60),
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(60),
            lease_duration: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(120),
            drain_poll_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024, // 1MB
        }
    }
}

impl BalanceConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a node that never rebalances.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Enable or disable rebalancing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the control loop poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the notification queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the blocking enqueue timeout.
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Set the master lease lifetime.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the drain wait bound.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the drain polling interval.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Set the per-call RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Check the configuration for values the control loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be > 0".into()));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::Config("lease_duration must be > 0".into()));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(Error::Config("drain_poll_interval must be > 0".into()));
        }
        if self.max_message_size < 64 {
            return Err(Error::Config(format!(
                "max_message_size too small: {}",
                self.max_message_size
            )));
        }
        Ok(())
    }
}
