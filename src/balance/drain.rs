//! Shutdown drain.
//!
//! Moves every hosted master to a sibling before the node stops, one master
//! at a time so each ranking sees the leases taken by earlier hand-offs, then
//! waits a bounded time for the hand-offs to be confirmed. The drain never
//! holds up shutdown past `drain_timeout`.

use crate::balance::monitor::DensityMonitor;
use crate::balance::negotiator::TransferPredicate;
use crate::balance::selector::{CandidateSelector, Transfer};
use crate::types::RnId;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{info, warn};

/// Outcome of a shutdown drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Transfers a sibling accepted.
    pub initiated: Vec<Transfer>,
    /// Masters no sibling would take.
    pub not_initiated: Vec<RnId>,
    /// Initiated transfers whose source stopped being master in time.
    pub completed: Vec<RnId>,
    /// Initiated transfers still pending at the deadline.
    pub timed_out: Vec<RnId>,
}

impl DrainReport {
    /// Check if every master left the node.
    pub fn is_clean(&self) -> bool {
        self.not_initiated.is_empty() && self.timed_out.is_empty()
    }
}

impl DensityMonitor {
    /// Hand off every hosted master before shutdown.
    ///
    /// Marks the node as draining first so peers' lease requests are refused
    /// while masters move out.
    pub async fn drain_for_shutdown(&self) -> DrainReport {
        let node_id = self.node_id;
        self.draining.store(true, Ordering::Release);
        let mut report = DrainReport::default();

        let Some(topology) = self.topology.current() else {
            warn!(node_id, "No topology, cannot drain masters");
            report.not_initiated = self.resident().masters().collect();
            return report;
        };

        // Wait out a routine pass already negotiating, then pick masters
        // with its leases in place.
        let negotiating = self.negotiation.lock().await;
        let masters = CandidateSelector::eligible_masters(self.resident().masters(), &self.leases);
        info!(node_id, masters = masters.len(), "Draining masters for shutdown");

        let selector = CandidateSelector::new(node_id, &topology, self.peers.as_ref());
        let negotiator = self.negotiator();

        for rn in masters {
            let sources = [rn];
            let pool = selector.candidate_pool(&sources);
            let ranked = selector.rank_pool(&pool).await;
            let candidates = selector.build_candidates(&ranked, &sources, None);

            match negotiator.negotiate(&candidates, TransferPredicate::Exit).await {
                Some(transfer) => {
                    info!(
                        node_id,
                        rn_id = %rn,
                        target_node = transfer.target_node,
                        "Drain transfer initiated"
                    );
                    report.initiated.push(transfer);
                }
                None => {
                    info!(
                        node_id,
                        rn_id = %rn,
                        candidates = candidates.len(),
                        "Drain transfer not initiated"
                    );
                    report.not_initiated.push(rn);
                }
            }
        }
        // The loop must be free to apply hand-off notifications.
        drop(negotiating);

        self.await_handoffs(&mut report).await;
        info!(
            node_id,
            initiated = report.initiated.len(),
            not_initiated = report.not_initiated.len(),
            completed = report.completed.len(),
            timed_out = report.timed_out.len(),
            "Drain finished"
        );
        report
    }

    /// Poll until every initiated source has stopped being master, or the
    /// drain timeout elapses.
    async fn await_handoffs(&self, report: &mut DrainReport) {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut pending: Vec<RnId> = report.initiated.iter().map(|t| t.source_rn).collect();

        loop {
            let resident = self.resident();
            pending.retain(|rn| {
                // A lease that merely expired does not mean the RN moved.
                let done = !self.leases.has_lease(*rn) && !resident.is_master(*rn);
                if done {
                    info!(node_id = self.node_id, rn_id = %rn, "Drain hand-off completed");
                    report.completed.push(*rn);
                }
                !done
            });

            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        for rn in pending {
            warn!(node_id = self.node_id, rn_id = %rn, "Drain hand-off timed out");
            report.timed_out.push(rn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{StaticTopology, Topology, ZoneInfo};
    use crate::config::BalanceConfig;
    use crate::testing::{RecordingInitiator, ScriptedPeers};
    use crate::types::{MdInfo, ReplicationRole, StateInfo};
    use std::sync::Arc;
    use std::time::Duration;

    /// Node 1 masters rg1 and rg2; rg1's sibling is on node 2, rg2's on node 3.
    fn topology() -> Topology {
        Topology::builder(1)
            .zone(ZoneInfo::primary(1, 2))
            .node(1, 1)
            .node(2, 1)
            .node(3, 1)
            .rn(RnId::new(1, 1), 1)
            .rn(RnId::new(1, 2), 2)
            .rn(RnId::new(2, 1), 1)
            .rn(RnId::new(2, 2), 3)
            .build()
            .unwrap()
    }

    fn monitor(peers: Arc<ScriptedPeers>) -> DensityMonitor {
        let config = BalanceConfig::default()
            .with_drain_timeout(Duration::from_secs(5))
            .with_drain_poll_interval(Duration::from_secs(1));
        let monitor = DensityMonitor::new(
            1,
            config,
            Arc::new(StaticTopology::new(topology())),
            peers,
            Arc::new(RecordingInitiator::accepting()),
        );
        monitor.apply(StateInfo::new(RnId::new(1, 1), ReplicationRole::Master, 1));
        monitor.apply(StateInfo::new(RnId::new(2, 1), ReplicationRole::Master, 1));
        monitor
    }

    fn roomy() -> MdInfo {
        MdInfo {
            master_count: 0,
            master_lease_count: 0,
            rn_count: 2,
            balanced_md: 50,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_one_target_of_two() {
        let peers = Arc::new(ScriptedPeers::new());
        peers.set_md_info(2, Some(roomy()));
        peers.set_unreachable(3);
        let monitor = monitor(peers);

        let report = monitor.drain_for_shutdown().await;

        assert!(monitor.is_draining());
        assert_eq!(report.initiated.len(), 1);
        assert_eq!(report.initiated[0].source_rn, RnId::new(1, 1));
        assert_eq!(report.initiated[0].target_rn, RnId::new(1, 2));
        assert_eq!(report.not_initiated, vec![RnId::new(2, 1)]);
        // Nothing confirmed the hand-off.
        assert_eq!(report.timed_out, vec![RnId::new(1, 1)]);
        assert!(!report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_observes_completion() {
        let peers = Arc::new(ScriptedPeers::new());
        peers.set_md_info(2, Some(roomy()));
        peers.set_md_info(3, Some(roomy()));
        let monitor = Arc::new(monitor(peers));

        let drain = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.drain_for_shutdown().await })
        };

        // Let both negotiations finish, then confirm the hand-offs.
        while monitor.leases().lease_count() < 2 {
            tokio::task::yield_now().await;
        }
        monitor.apply(StateInfo::new(RnId::new(1, 1), ReplicationRole::Replica, 2));
        monitor.apply(StateInfo::new(RnId::new(2, 1), ReplicationRole::Replica, 2));

        let report = drain.await.unwrap();
        assert_eq!(report.initiated.len(), 2);
        assert_eq!(report.completed.len(), 2);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_predicate_ignores_balance() {
        let peers = Arc::new(ScriptedPeers::new());
        // Already above its balanced density, still has room.
        peers.set_md_info(
            2,
            Some(MdInfo {
                master_count: 1,
                master_lease_count: 0,
                rn_count: 2,
                balanced_md: 0,
            }),
        );
        peers.set_unreachable(3);
        let monitor = monitor(peers);

        let report = monitor.drain_for_shutdown().await;
        assert_eq!(report.initiated.len(), 1);
    }
}
