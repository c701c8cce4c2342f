//! Cluster topology as seen by the balancing layer.
//!
//! The topology service itself lives outside this crate. What the balancer
//! needs is a read-only snapshot answering "which node hosts this RN", "which
//! zone is this node in" and "who else is in this replication group". The
//! snapshot may be stale; callers tolerate missing entries without error.

use crate::error::{Error, Result};
use crate::types::{GroupId, NodeId, RnId, ZoneId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kind of zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneKind {
    /// Primary zones host electable RNs.
    Primary,
    /// Secondary zones host read-only copies and never host masters.
    Secondary,
}

/// Zone description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneInfo {
    /// Zone identifier.
    pub id: ZoneId,
    /// Primary or secondary.
    pub kind: ZoneKind,
    /// Replicas of each group placed in this zone.
    pub replication_factor: u32,
    /// Whether masters should preferably live in this zone.
    pub master_affinity: bool,
}

impl ZoneInfo {
    /// Create a primary zone.
    pub fn primary(id: ZoneId, replication_factor: u32) -> Self {
        Self {
            id,
            kind: ZoneKind::Primary,
            replication_factor,
            master_affinity: false,
        }
    }

    /// Create a secondary zone.
    pub fn secondary(id: ZoneId, replication_factor: u32) -> Self {
        Self {
            id,
            kind: ZoneKind::Secondary,
            replication_factor,
            master_affinity: false,
        }
    }

    /// Mark the zone as preferred for masters.
    pub fn with_master_affinity(mut self, affinity: bool) -> Self {
        self.master_affinity = affinity;
        self
    }

    /// Check if this is a primary zone.
    pub fn is_primary(&self) -> bool {
        self.kind == ZoneKind::Primary
    }
}

/// Immutable topology snapshot.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    seq: u64,
    zones: BTreeMap<ZoneId, ZoneInfo>,
    nodes: BTreeMap<NodeId, ZoneId>,
    rns: BTreeMap<RnId, NodeId>,
}

impl Topology {
    /// Start building a topology with the given sequence number.
    pub fn builder(seq: u64) -> TopologyBuilder {
        TopologyBuilder {
            topology: Topology {
                seq,
                ..Default::default()
            },
        }
    }

    /// Monotonic sequence number of this snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// All nodes.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Zone of a node.
    pub fn zone_of(&self, node: NodeId) -> Option<&ZoneInfo> {
        self.nodes.get(&node).and_then(|zone| self.zones.get(zone))
    }

    /// Node currently hosting an RN.
    pub fn node_of(&self, rn: RnId) -> Option<NodeId> {
        self.rns.get(&rn).copied()
    }

    /// RNs hosted by a node.
    pub fn rns_on(&self, node: NodeId) -> Vec<RnId> {
        self.rns
            .iter()
            .filter(|(_, host)| **host == node)
            .map(|(rn, _)| *rn)
            .collect()
    }

    /// Number of RNs hosted by a node.
    pub fn rn_count(&self, node: NodeId) -> u32 {
        self.rns.values().filter(|host| **host == node).count() as u32
    }

    /// Members of a replication group.
    pub fn group_members(&self, group: GroupId) -> Vec<RnId> {
        self.rns
            .range(RnId::new(group, 0)..=RnId::new(group, u32::MAX))
            .map(|(rn, _)| *rn)
            .collect()
    }

    /// The member of `group` hosted on `node`, if any.
    pub fn member_on(&self, group: GroupId, node: NodeId) -> Option<RnId> {
        self.group_members(group)
            .into_iter()
            .find(|rn| self.node_of(*rn) == Some(node))
    }

    /// Whether the node sits in a primary zone.
    pub fn is_primary_node(&self, node: NodeId) -> bool {
        self.zone_of(node).map(|z| z.is_primary()).unwrap_or(false)
    }

    /// Whether the node's zone has master affinity.
    pub fn has_master_affinity(&self, node: NodeId) -> bool {
        self.zone_of(node).map(|z| z.master_affinity).unwrap_or(false)
    }

    /// Whether any zone is marked for master affinity.
    pub fn any_master_affinity(&self) -> bool {
        self.zones.values().any(|z| z.master_affinity)
    }

    /// Sum of replication factors over primary zones.
    pub fn primary_rf(&self) -> u32 {
        self.zones
            .values()
            .filter(|z| z.is_primary())
            .map(|z| z.replication_factor)
            .sum()
    }

    /// Sum of replication factors over primary zones whose affinity flag
    /// equals `affinity`.
    pub fn primary_rf_with_affinity(&self, affinity: bool) -> u32 {
        self.zones
            .values()
            .filter(|z| z.is_primary() && z.master_affinity == affinity)
            .map(|z| z.replication_factor)
            .sum()
    }
}

/// Builder for [`Topology`].
#[derive(Debug)]
pub struct TopologyBuilder {
    topology: Topology,
}

impl TopologyBuilder {
    /// Add a zone.
    pub fn zone(mut self, zone: ZoneInfo) -> Self {
        self.topology.zones.insert(zone.id, zone);
        self
    }

    /// Add a node in a zone.
    pub fn node(mut self, node: NodeId, zone: ZoneId) -> Self {
        self.topology.nodes.insert(node, zone);
        self
    }

    /// Place an RN on a node.
    pub fn rn(mut self, rn: RnId, node: NodeId) -> Self {
        self.topology.rns.insert(rn, node);
        self
    }

    /// Validate references and produce the snapshot.
    pub fn build(self) -> Result<Topology> {
        let topo = self.topology;
        for (node, zone) in &topo.nodes {
            if !topo.zones.contains_key(zone) {
                return Err(Error::Topology(format!(
                    "node {} references unknown zone {}",
                    node, zone
                )));
            }
        }
        for (rn, node) in &topo.rns {
            if !topo.nodes.contains_key(node) {
                return Err(Error::Topology(format!(
                    "{} placed on unknown node {}",
                    rn, node
                )));
            }
        }
        Ok(topo)
    }
}

/// Source of the current topology.
///
/// `None` means the node has not received a topology yet. The balancer skips
/// work until one shows up.
pub trait TopologyProvider: Send + Sync + 'static {
    /// Latest snapshot, if any.
    fn current(&self) -> Option<Arc<Topology>>;
}

/// Topology provider backed by a swappable snapshot.
#[derive(Debug, Default)]
pub struct StaticTopology {
    current: RwLock<Option<Arc<Topology>>>,
}

impl StaticTopology {
    /// Create a provider holding `topology`.
    pub fn new(topology: Topology) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(topology))),
        }
    }

    /// Create a provider with no topology yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the snapshot. Older sequence numbers are ignored.
    pub fn update(&self, topology: Topology) -> bool {
        let mut current = self.current.write();
        if let Some(existing) = current.as_ref() {
            if existing.seq() > topology.seq() {
                tracing::debug!(
                    current = existing.seq(),
                    offered = topology.seq(),
                    "Ignoring older topology"
                );
                return false;
            }
        }
        *current = Some(Arc::new(topology));
        true
    }

    /// Drop the snapshot, making the topology unavailable.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

impl TopologyProvider for StaticTopology {
    fn current(&self) -> Option<Arc<Topology>> {
        self.current.read().clone()
    }
}
