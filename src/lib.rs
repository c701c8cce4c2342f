//! Master-density rebalancing for a replicated key-value store cluster.
//!
//! Each storage node hosts replicated nodes (RNs) of many replication
//! groups. Exactly one RN per group is the master. This crate runs a
//! per-node control loop that keeps masters spread evenly across nodes:
//!
//! - **Detects imbalance** from role-change notifications and the topology
//! - **Ranks peers** hosting sibling replicas by post-transfer density and
//!   zone affinity
//! - **Negotiates transfers** with short-lived leases and rolls back on failure
//! - **Drains masters** off a node that is shutting down, bounded by a timeout
//!
//! # Example
//!
//! ```rust,no_run
//! use master_density::cluster::{LoggingShutdown, StaticTopology, Topology, ZoneInfo};
//! use master_density::network::TcpPeerClient;
//! use master_density::{BalanceConfig, MasterBalance, ReplicationRole, RnId, StateInfo};
//! use std::sync::Arc;
//! # use master_density::network::MasterTransferInitiator;
//! # fn replication_layer() -> Arc<dyn MasterTransferInitiator> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let topology = Topology::builder(1)
//!         .zone(ZoneInfo::primary(1, 3))
//!         .node(1, 1)
//!         .node(2, 1)
//!         .node(3, 1)
//!         .rn(RnId::new(1, 1), 1)
//!         .rn(RnId::new(1, 2), 2)
//!         .rn(RnId::new(1, 3), 3)
//!         .build()?;
//!
//!     let config = BalanceConfig::default();
//!     let peers = Arc::new(TcpPeerClient::new(1, &config));
//!     peers.add_peer(2, "10.0.0.2:7100".parse()?);
//!     peers.add_peer(3, "10.0.0.3:7100".parse()?);
//!
//!     let balance = MasterBalance::start(
//!         1,
//!         config,
//!         Arc::new(StaticTopology::new(topology)),
//!         peers,
//!         replication_layer(),
//!         Arc::new(LoggingShutdown),
//!     )?;
//!
//!     // Feed role changes as the replication layer reports them.
//!     balance
//!         .note_state(StateInfo::new(RnId::new(1, 1), ReplicationRole::Master, 1))
//!         .await?;
//!
//!     // Before stopping the node.
//!     let report = balance.drain_for_shutdown().await;
//!     println!("drained {} masters", report.completed.len());
//!     balance.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       Replication layer / node manager       │
//! └─────────────────────────────────────────────┘
//!          │ note_state            ▲ initiate_master_transfer
//!          ▼                       │
//! ┌─────────────────────────────────────────────┐
//! │               MasterBalance                 │
//! │  Enabled(DensityMonitor) | Disabled         │
//! └─────────────────────────────────────────────┘
//!          │                       ▲
//!          ▼ PeerClient            │ NetworkServer
//! ┌─────────────────────────────────────────────┐
//! │                 Peer nodes                  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Densities
//!
//! All densities are integer percentages of the RNs resident on a node:
//!
//! - **MD**: masters hosted
//! - **BMD**: the balanced target for the node
//! - **PTMD**: the density after accepting one more master

pub mod balance;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod testing;
pub mod types;

pub use balance::{DrainReport, MasterBalance};
pub use config::BalanceConfig;
pub use error::{Error, Result};
pub use types::{MasterLeaseInfo, MdInfo, NodeId, ReplicationRole, RnId, StateInfo};
