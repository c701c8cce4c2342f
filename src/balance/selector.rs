//! Candidate discovery and ranking.
//!
//! The pool is every primary-zone peer hosting a sibling replica of one of
//! our masters. Ranking asks each peer for its density, drops those without
//! room, and orders the rest in two tiers: peers in master-affinity zones
//! first, then the rest, each tier by ascending post-transfer density.

use crate::balance::lease::LeaseManager;
use crate::cluster::Topology;
use crate::network::PeerClient;
use crate::types::{NodeId, RnId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A proposed master transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Local master giving up mastership.
    pub source_rn: RnId,
    /// Sibling replica that would become master.
    pub target_rn: RnId,
    /// Node hosting `target_rn`.
    pub target_node: NodeId,
    /// Target's density after accepting the master.
    pub ptmd: u32,
    /// Whether the target node's zone has master affinity.
    pub target_affinity: bool,
}

/// Ranked peers, bucketed by affinity and then by post-transfer density.
#[derive(Debug, Clone, Default)]
pub struct RankedPool {
    affinity: BTreeMap<u32, Vec<NodeId>>,
    other: BTreeMap<u32, Vec<NodeId>>,
}

impl RankedPool {
    /// Add a peer to its bucket.
    pub fn insert(&mut self, node: NodeId, affinity: bool, ptmd: u32) {
        let tier = if affinity {
            &mut self.affinity
        } else {
            &mut self.other
        };
        tier.entry(ptmd).or_default().push(node);
    }

    /// Tiers in preference order, each tagged with its affinity.
    pub fn tiers(&self) -> [(bool, &BTreeMap<u32, Vec<NodeId>>); 2] {
        [(true, &self.affinity), (false, &self.other)]
    }

    /// Every ranked peer in preference order as `(affinity, ptmd, node)`.
    pub fn iter(&self) -> impl Iterator<Item = (bool, u32, NodeId)> + '_ {
        self.tiers().into_iter().flat_map(|(affinity, tier)| {
            tier.iter()
                .flat_map(move |(ptmd, nodes)| nodes.iter().map(move |n| (affinity, *ptmd, *n)))
        })
    }

    /// Number of ranked peers.
    pub fn len(&self) -> usize {
        self.affinity
            .values()
            .chain(self.other.values())
            .map(Vec::len)
            .sum()
    }

    /// Check if no peer survived ranking.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finds and orders transfer candidates for one node.
pub struct CandidateSelector<'a> {
    node_id: NodeId,
    topology: &'a Topology,
    peers: &'a dyn PeerClient,
}

impl<'a> CandidateSelector<'a> {
    /// Create a selector for `node_id`.
    pub fn new(node_id: NodeId, topology: &'a Topology, peers: &'a dyn PeerClient) -> Self {
        Self {
            node_id,
            topology,
            peers,
        }
    }

    /// Density this node would have after giving up one master.
    ///
    /// Outstanding leases already count as given up. `overload` adds one
    /// master back so a node asked to try harder keeps looking even when it
    /// is at, not above, its balanced density.
    pub fn lowered_md(masters: u32, leases: u32, rn_count: u32, overload: bool) -> i64 {
        if rn_count == 0 {
            return 0;
        }
        let boost = i64::from(overload);
        (i64::from(masters) - i64::from(leases) - 1 + boost) * 100 / i64::from(rn_count)
    }

    /// Masters that may be moved: not already held by a lease.
    pub fn eligible_masters<I>(masters: I, leases: &LeaseManager) -> Vec<RnId>
    where
        I: IntoIterator<Item = RnId>,
    {
        masters
            .into_iter()
            .filter(|rn| !leases.has_lease(*rn))
            .collect()
    }

    /// Primary-zone peers hosting a sibling of any of `masters`.
    pub fn candidate_pool(&self, masters: &[RnId]) -> BTreeSet<NodeId> {
        let mut pool = BTreeSet::new();
        for master in masters {
            for sibling in self.topology.group_members(master.group) {
                if sibling == *master {
                    continue;
                }
                let Some(node) = self.topology.node_of(sibling) else {
                    continue;
                };
                if node == self.node_id || !self.topology.is_primary_node(node) {
                    continue;
                }
                pool.insert(node);
            }
        }
        pool
    }

    /// Query every pool member and bucket the ones with room.
    pub async fn rank_pool(&self, pool: &BTreeSet<NodeId>) -> RankedPool {
        let mut ranked = RankedPool::default();
        for &node in pool {
            match self.peers.md_info(node).await {
                Ok(Some(info)) => {
                    let ptmd = info.ptmd();
                    if ptmd > 100 {
                        debug!(node, ptmd, "Peer has no room for another master");
                        continue;
                    }
                    ranked.insert(node, self.topology.has_master_affinity(node), ptmd);
                }
                Ok(None) => {
                    debug!(node, "Peer not participating in master balancing");
                }
                Err(e) if e.is_routine() => {
                    debug!(node, error = %e, "Peer unreachable during ranking");
                }
                Err(e) => {
                    warn!(node, error = %e, "Peer failed during ranking");
                }
            }
        }
        ranked
    }

    /// Pair ranked peers with local masters, in ranking order.
    ///
    /// With `lowered_md` set, the tier sharing this node's affinity is
    /// skipped once moving a master would leave no local benefit; the other
    /// tier is always walked. Drain passes `None` to consider everything.
    pub fn build_candidates(
        &self,
        ranked: &RankedPool,
        sources: &[RnId],
        lowered_md: Option<i64>,
    ) -> Vec<Transfer> {
        let local_affinity = self.topology.has_master_affinity(self.node_id);
        let mut candidates = Vec::new();

        for (affinity, tier) in ranked.tiers() {
            let same_affinity = affinity == local_affinity;
            for (&ptmd, nodes) in tier {
                if same_affinity && lowered_md.is_some_and(|md| md <= 0) {
                    break;
                }
                for &node in nodes {
                    for source in sources {
                        // Stale topology may not know the sibling yet.
                        let Some(target_rn) = self.topology.member_on(source.group, node) else {
                            continue;
                        };
                        candidates.push(Transfer {
                            source_rn: *source,
                            target_rn,
                            target_node: node,
                            ptmd,
                            target_affinity: affinity,
                        });
                    }
                }
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ZoneInfo;
    use crate::testing::ScriptedPeers;
    use crate::types::MdInfo;

    /// Node 1 in zone 1 (no affinity) hosts rg1 and rg2 masters; siblings
    /// spread over nodes 2,3 (zone 1), 4 (affinity zone 2), 5 (secondary).
    fn topology() -> Topology {
        Topology::builder(1)
            .zone(ZoneInfo::primary(1, 2))
            .zone(ZoneInfo::primary(2, 1).with_master_affinity(true))
            .zone(ZoneInfo::secondary(3, 1))
            .node(1, 1)
            .node(2, 1)
            .node(3, 1)
            .node(4, 2)
            .node(5, 3)
            .rn(RnId::new(1, 1), 1)
            .rn(RnId::new(1, 2), 2)
            .rn(RnId::new(1, 3), 4)
            .rn(RnId::new(1, 4), 5)
            .rn(RnId::new(2, 1), 1)
            .rn(RnId::new(2, 2), 3)
            .rn(RnId::new(2, 3), 4)
            .build()
            .unwrap()
    }

    fn md(masters: u32, rns: u32) -> MdInfo {
        MdInfo {
            master_count: masters,
            master_lease_count: 0,
            rn_count: rns,
            balanced_md: 50,
        }
    }

    #[test]
    fn test_lowered_md() {
        assert_eq!(CandidateSelector::lowered_md(3, 0, 6, false), 33);
        assert_eq!(CandidateSelector::lowered_md(3, 1, 6, false), 16);
        assert_eq!(CandidateSelector::lowered_md(1, 0, 6, false), 0);
        assert_eq!(CandidateSelector::lowered_md(1, 0, 6, true), 16);
        assert_eq!(CandidateSelector::lowered_md(1, 1, 4, false), -25);
    }

    #[test]
    fn test_pool_excludes_self_and_secondary() {
        let topo = topology();
        let peers = ScriptedPeers::new();
        let selector = CandidateSelector::new(1, &topo, &peers);

        let pool = selector.candidate_pool(&[RnId::new(1, 1), RnId::new(2, 1)]);
        assert_eq!(pool.into_iter().collect::<Vec<_>>(), vec![2, 3, 4]);

        let pool = selector.candidate_pool(&[RnId::new(2, 1)]);
        assert_eq!(pool.into_iter().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_rank_orders_affinity_then_density() {
        let topo = topology();
        let peers = ScriptedPeers::new();
        peers.set_md_info(2, Some(md(0, 4))); // ptmd 25
        peers.set_md_info(3, Some(md(2, 4))); // ptmd 75
        peers.set_md_info(4, Some(md(1, 2))); // ptmd 100, affinity
        let selector = CandidateSelector::new(1, &topo, &peers);

        let ranked = selector.rank_pool(&[2, 3, 4].into_iter().collect()).await;
        let order: Vec<_> = ranked.iter().collect();
        assert_eq!(order, vec![(true, 100, 4), (false, 25, 2), (false, 75, 3)]);
    }

    #[tokio::test]
    async fn test_rank_drops_full_and_failed_peers() {
        let topo = topology();
        let peers = ScriptedPeers::new();
        peers.set_md_info(2, Some(md(2, 2))); // ptmd 150
        peers.set_unreachable(3);
        peers.set_md_info(4, None);
        let selector = CandidateSelector::new(1, &topo, &peers);

        let ranked = selector.rank_pool(&[2, 3, 4].into_iter().collect()).await;
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_build_candidates_pairs_siblings() {
        let topo = topology();
        let peers = ScriptedPeers::new();
        let selector = CandidateSelector::new(1, &topo, &peers);

        let mut ranked = RankedPool::default();
        ranked.insert(3, false, 50);
        ranked.insert(2, false, 25);
        ranked.insert(4, true, 60);

        let sources = [RnId::new(1, 1), RnId::new(2, 1)];
        let candidates = selector.build_candidates(&ranked, &sources, Some(33));
        let pairs: Vec<_> = candidates
            .iter()
            .map(|c| (c.source_rn, c.target_rn, c.ptmd))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (RnId::new(1, 1), RnId::new(1, 3), 60),
                (RnId::new(2, 1), RnId::new(2, 3), 60),
                (RnId::new(1, 1), RnId::new(1, 2), 25),
                (RnId::new(2, 1), RnId::new(2, 2), 50),
            ]
        );
        assert!(candidates[0].target_affinity);
        assert!(!candidates[2].target_affinity);
    }

    #[test]
    fn test_build_candidates_skips_same_affinity_without_benefit() {
        let topo = topology();
        let peers = ScriptedPeers::new();
        let selector = CandidateSelector::new(1, &topo, &peers);

        let mut ranked = RankedPool::default();
        ranked.insert(2, false, 25);
        ranked.insert(4, true, 60);

        let sources = [RnId::new(1, 1)];
        let candidates = selector.build_candidates(&ranked, &sources, Some(0));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].target_node, 4);

        // Drain considers every tier.
        let candidates = selector.build_candidates(&ranked, &sources, None);
        assert_eq!(candidates.len(), 2);
    }
}
