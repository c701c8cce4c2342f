//! Cluster topology and lifecycle hooks consumed by the balancer.

pub mod lifecycle;
pub mod topology;

pub use lifecycle::{LoggingShutdown, NoopShutdown, ShutdownRequester};
pub use topology::{
    StaticTopology, Topology, TopologyBuilder, TopologyProvider, ZoneInfo, ZoneKind,
};
