//! Balanced master density calculations.
//!
//! Pure functions over a topology snapshot. Densities are integer
//! percentages of the RNs resident on a node.

use crate::cluster::Topology;
use crate::types::NodeId;

/// Density policy for one node under one topology snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BalancePolicy<'a> {
    topology: &'a Topology,
    node_id: NodeId,
}

impl<'a> BalancePolicy<'a> {
    /// Create the policy for `node_id`.
    pub fn new(topology: &'a Topology, node_id: NodeId) -> Self {
        Self { topology, node_id }
    }

    /// Balanced master density for `rn_count` RNs under replication
    /// factor `rf`.
    ///
    /// With no more RNs than the replication factor the node still has room
    /// for exactly one master. Otherwise the balanced master count is
    /// rounded up so capacity that is not a multiple of `rf` does not make
    /// masters oscillate between nodes.
    pub fn rf_to_bmd(rf: u32, rn_count: u32) -> u32 {
        if rn_count == 0 {
            return 0;
        }
        let rf = rf.max(1);
        if rn_count <= rf {
            return 100 / rn_count;
        }
        let balanced_masters = rn_count.div_ceil(rf);
        balanced_masters * 100 / rn_count
    }

    /// RNs the topology places on this node.
    pub fn rn_count(&self) -> u32 {
        self.topology.rn_count(self.node_id)
    }

    /// Whether this node's zone has master affinity.
    pub fn local_affinity(&self) -> bool {
        self.topology.has_master_affinity(self.node_id)
    }

    /// Balanced master density for this node.
    ///
    /// Without affinity zones the whole primary replication factor counts.
    /// With affinity zones, nodes outside them get zero so every master
    /// moves off, and nodes inside them share the masters by the affinity
    /// zones' combined replication factor.
    pub fn bmd(&self) -> u32 {
        let rn_count = self.rn_count();
        if !self.topology.any_master_affinity() {
            return Self::rf_to_bmd(self.topology.primary_rf(), rn_count);
        }
        if !self.local_affinity() {
            return 0;
        }
        Self::rf_to_bmd(self.topology.primary_rf_with_affinity(true), rn_count)
    }

    /// Density of one master per group spread over the primary zones that
    /// share this node's affinity. Used as the threshold for alerting
    /// neighbors, not for deciding transfers.
    pub fn current_affinity_bmd(&self) -> u32 {
        let rf = self
            .topology
            .primary_rf_with_affinity(self.local_affinity());
        if rf == 0 {
            return 100;
        }
        100 / rf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ZoneInfo;
    use crate::types::RnId;

    fn single_zone(rf: u32, rns_on_node: u32) -> Topology {
        let mut builder = Topology::builder(1).zone(ZoneInfo::primary(1, rf)).node(1, 1);
        for group in 0..rns_on_node {
            builder = builder.rn(RnId::new(group, 1), 1);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_rf_to_bmd_small_node() {
        for rn_count in 1..=3 {
            assert_eq!(BalancePolicy::rf_to_bmd(3, rn_count), 100 / rn_count);
        }
    }

    #[test]
    fn test_rf_to_bmd_rounds_up() {
        assert_eq!(BalancePolicy::rf_to_bmd(3, 6), 33);
        // ceil(7 / 3) = 3 masters
        assert_eq!(BalancePolicy::rf_to_bmd(3, 7), 42);
        assert_eq!(BalancePolicy::rf_to_bmd(0, 4), 100);
        assert_eq!(BalancePolicy::rf_to_bmd(3, 0), 0);
    }

    #[test]
    fn test_rf_to_bmd_non_increasing_in_rf() {
        for rn_count in 2..40 {
            let mut last = u32::MAX;
            for rf in 1..rn_count {
                let bmd = BalancePolicy::rf_to_bmd(rf, rn_count);
                assert!(bmd <= last, "rf={} rn_count={} bmd={}", rf, rn_count, bmd);
                last = bmd;
            }
        }
    }

    #[test]
    fn test_bmd_without_affinity() {
        let topo = single_zone(3, 6);
        let policy = BalancePolicy::new(&topo, 1);
        assert_eq!(policy.rn_count(), 6);
        assert_eq!(policy.bmd(), 33);
        assert_eq!(policy.current_affinity_bmd(), 33);
    }

    #[test]
    fn test_bmd_with_affinity() {
        let topo = Topology::builder(1)
            .zone(ZoneInfo::primary(1, 2).with_master_affinity(true))
            .zone(ZoneInfo::primary(2, 1))
            .node(1, 1)
            .node(2, 2)
            .rn(RnId::new(1, 1), 1)
            .rn(RnId::new(2, 1), 1)
            .rn(RnId::new(3, 1), 1)
            .rn(RnId::new(1, 2), 2)
            .build()
            .unwrap();

        let inside = BalancePolicy::new(&topo, 1);
        assert!(inside.local_affinity());
        // rf 2 over 3 RNs: ceil(3/2) = 2 masters
        assert_eq!(inside.bmd(), 66);
        assert_eq!(inside.current_affinity_bmd(), 50);

        let outside = BalancePolicy::new(&topo, 2);
        assert_eq!(outside.bmd(), 0);
        assert_eq!(outside.current_affinity_bmd(), 100);
    }
}
