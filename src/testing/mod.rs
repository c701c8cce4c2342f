//! Testing utilities for the master balancing layer.
//!
//! This module provides tools for exercising the balancer without a real
//! replication layer:
//! - Scripted peers for failure injection
//! - A recording transfer initiator and shutdown requester
//! - An in-process multi-node cluster
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TestCluster                             │
//! │                                                                 │
//! │   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │   │ MasterBalance│   │ MasterBalance│   │ MasterBalance│        │
//! │   │    node 1    │   │    node 2    │   │    node 3    │        │
//! │   └──────┬───────┘   └──────┬───────┘   └──────┬───────┘        │
//! │          └──────────────────┼──────────────────┘                │
//! │                             ▼                                   │
//! │   ┌───────────────────────────────────────────────────────────┐ │
//! │   │ InProcessNetwork (PeerClient)   ClusterInitiator          │ │
//! │   │  - isolate / heal nodes          - completes transfers    │ │
//! │   └───────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use master_density::testing::TestCluster;
//!
//! let cluster = TestCluster::start(topology, BalanceConfig::default())?;
//! cluster.assign_masters(&[RnId::new(1, 1), RnId::new(2, 1)]).await?;
//! cluster.network().isolate(2);
//! ```

mod cluster;
mod fakes;

#[cfg(test)]
mod balance_scenario_tests;

pub use cluster::{ClusterInitiator, InProcessNetwork, TestCluster};
pub use fakes::{RecordingInitiator, RecordingShutdown, ScriptedPeers};

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
