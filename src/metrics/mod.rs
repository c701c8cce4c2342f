//! Metrics for the master balancing layer.
//!
//! Prometheus-style counters and gauges describing what the control loop
//! and the lease protocol have been doing:
//! - rebalance passes and transfer outcomes
//! - leases granted and denied to peers
//! - notification queue depth and master/lease gauges
//!
//! # Example
//!
//! ```rust,ignore
//! let snapshot = balancer.metrics().snapshot();
//! println!("transfers: {}", snapshot.transfers_initiated);
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

/// Metrics kept by one node's balancer.
#[derive(Debug)]
pub struct BalanceMetrics {
    /// Control loop passes that evaluated density.
    pub rebalance_passes: Counter,
    /// Passes where the node needed rebalancing.
    pub rebalance_needed: Counter,
    /// Transfers accepted by a peer and initiated locally.
    pub transfers_initiated: Counter,
    /// Negotiations rolled back after the lease was granted.
    pub transfer_rollbacks: Counter,
    /// Candidates skipped because the peer failed.
    pub peer_failures: Counter,
    /// Leases granted to peers.
    pub leases_granted: Counter,
    /// Leases denied to peers.
    pub leases_denied: Counter,
    /// Overload alerts sent to neighbors.
    pub overload_alerts_sent: Counter,
    /// Overload alerts received from neighbors.
    pub overload_alerts_received: Counter,

    /// Notifications waiting in the queue.
    pub queue_depth: Gauge,
    /// Masters hosted.
    pub active_masters: Gauge,
    /// Replicas hosted.
    pub active_replicas: Gauge,
}

impl BalanceMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            rebalance_passes: Counter::new("md_rebalance_passes_total", "Density evaluations"),
            rebalance_needed: Counter::new(
                "md_rebalance_needed_total",
                "Evaluations that found the node unbalanced",
            ),
            transfers_initiated: Counter::new(
                "md_transfers_initiated_total",
                "Master transfers initiated",
            ),
            transfer_rollbacks: Counter::new(
                "md_transfer_rollbacks_total",
                "Negotiations rolled back after a lease grant",
            ),
            peer_failures: Counter::new(
                "md_peer_failures_total",
                "Candidates skipped because the peer call failed",
            ),
            leases_granted: Counter::new("md_leases_granted_total", "Leases granted to peers"),
            leases_denied: Counter::new("md_leases_denied_total", "Leases denied to peers"),
            overload_alerts_sent: Counter::new(
                "md_overload_alerts_sent_total",
                "Overload alerts sent to neighbors",
            ),
            overload_alerts_received: Counter::new(
                "md_overload_alerts_received_total",
                "Overload alerts received from neighbors",
            ),

            queue_depth: Gauge::new("md_queue_depth", "Role-change notifications queued"),
            active_masters: Gauge::new("md_active_masters", "Masters hosted"),
            active_replicas: Gauge::new("md_active_replicas", "Replicas hosted"),
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> BalanceMetricsSnapshot {
        BalanceMetricsSnapshot {
            rebalance_passes: self.rebalance_passes.get(),
            rebalance_needed: self.rebalance_needed.get(),
            transfers_initiated: self.transfers_initiated.get(),
            transfer_rollbacks: self.transfer_rollbacks.get(),
            peer_failures: self.peer_failures.get(),
            leases_granted: self.leases_granted.get(),
            leases_denied: self.leases_denied.get(),
            overload_alerts_sent: self.overload_alerts_sent.get(),
            overload_alerts_received: self.overload_alerts_received.get(),
            queue_depth: self.queue_depth.get(),
            active_masters: self.active_masters.get(),
            active_replicas: self.active_replicas.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.rebalance_passes);
        add_metric!("counter", self.rebalance_needed);
        add_metric!("counter", self.transfers_initiated);
        add_metric!("counter", self.transfer_rollbacks);
        add_metric!("counter", self.peer_failures);
        add_metric!("counter", self.leases_granted);
        add_metric!("counter", self.leases_denied);
        add_metric!("counter", self.overload_alerts_sent);
        add_metric!("counter", self.overload_alerts_received);

        add_metric!("gauge", self.queue_depth);
        add_metric!("gauge", self.active_masters);
        add_metric!("gauge", self.active_replicas);

        output
    }
}

impl Default for BalanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of balancer metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceMetricsSnapshot {
    pub rebalance_passes: u64,
    pub rebalance_needed: u64,
    pub transfers_initiated: u64,
    pub transfer_rollbacks: u64,
    pub peer_failures: u64,
    pub leases_granted: u64,
    pub leases_denied: u64,
    pub overload_alerts_sent: u64,
    pub overload_alerts_received: u64,
    pub queue_depth: i64,
    pub active_masters: i64,
    pub active_replicas: i64,
}

impl BalanceMetricsSnapshot {
    /// Fraction of lease requests this node granted.
    pub fn lease_grant_rate(&self) -> f64 {
        let total = self.leases_granted + self.leases_denied;
        if total == 0 {
            0.0
        } else {
            self.leases_granted as f64 / total as f64
        }
    }
}
