//! Master density balancing.
//!
//! Keeps the master role of each replication group spread evenly across the
//! nodes hosting it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DensityMonitor                         │
//! │   notification queue ─► resident sets ─► needs_rebalancing    │
//! └──────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌────────────────┐  ┌───────────────────┐  ┌────────────────────┐
//! │ BalancePolicy  │  │ CandidateSelector │  │ TransferNegotiator │
//! │ bmd, ptmd      │  │ pool, rank, pair  │  │ lease ► initiate   │
//! └────────────────┘  └───────────────────┘  └────────────────────┘
//!                                                      │
//!                                                      ▼
//!                                             ┌────────────────┐
//!                                             │  LeaseManager  │
//!                                             └────────────────┘
//! ```
//!
//! [`MasterBalance`] wraps the monitor so a node with balancing turned off
//! still answers peers.

pub mod drain;
pub mod lease;
pub mod monitor;
pub mod negotiator;
pub mod policy;
pub mod selector;
pub mod service;

pub use drain::DrainReport;
pub use lease::LeaseManager;
pub use monitor::{DensityMonitor, ResidentRns};
pub use negotiator::{TransferNegotiator, TransferPredicate};
pub use policy::BalancePolicy;
pub use selector::{CandidateSelector, RankedPool, Transfer};
pub use service::MasterBalance;
