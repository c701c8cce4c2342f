//! Lease-protected master transfer negotiation.
//!
//! For each candidate in order: re-check the target's live density, apply
//! the acceptance predicate, take a lease on the target replica, take a local
//! lease on the source master, then ask the replication layer to start the
//! hand-off. Any failure after the remote lease is granted rolls back the
//! leases this attempt took and moves on. Nothing is retried within a pass.

use crate::balance::lease::LeaseManager;
use crate::balance::selector::Transfer;
use crate::metrics::BalanceMetrics;
use crate::network::{MasterTransferInitiator, PeerClient};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decides whether a target with live density `target` may take a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPredicate {
    /// Regular rebalancing.
    Routine {
        /// Whether the local node's zone has master affinity.
        source_affinity: bool,
    },
    /// Shutdown drain: any target with room.
    Exit,
}

impl TransferPredicate {
    /// Evaluate the predicate.
    pub fn accepts(&self, candidate: &Transfer, target: &MdInfo) -> bool {
        let ptmd = target.ptmd();
        if ptmd > 100 {
            return false;
        }
        match *self {
            TransferPredicate::Exit => true,
            TransferPredicate::Routine { source_affinity } => {
                match (source_affinity, candidate.target_affinity) {
                    // Same footing: only if the target stays balanced.
                    (s, t) if s == t => ptmd <= target.balanced_md,
                    // Masters drift towards affinity zones.
                    (false, true) => true,
                    // And never leave them.
                    _ => false,
                }
            }
        }
    }
}

/// Runs the transfer handshake for one node.
pub struct TransferNegotiator<'a> {
    node_id: NodeId,
    peers: &'a dyn PeerClient,
    initiator: &'a dyn MasterTransferInitiator,
    leases: &'a LeaseManager,
    lease_duration: Duration,
    metrics: &'a BalanceMetrics,
}

impl<'a> TransferNegotiator<'a> {
    /// Create a negotiator.
    pub fn new(
        node_id: NodeId,
        peers: &'a dyn PeerClient,
        initiator: &'a dyn MasterTransferInitiator,
        leases: &'a LeaseManager,
        lease_duration: Duration,
        metrics: &'a BalanceMetrics,
    ) -> Self {
        Self {
            node_id,
            peers,
            initiator,
            leases,
            lease_duration,
            metrics,
        }
    }

    /// Try candidates in order and return the first transfer started.
    pub async fn negotiate(
        &self,
        candidates: &[Transfer],
        predicate: TransferPredicate,
    ) -> Option<Transfer> {
        for candidate in candidates {
            // Earlier candidates in this pass may have engaged the source.
            if self.leases.has_lease(candidate.source_rn) {
                continue;
            }

            let target = match self.peers.md_info(candidate.target_node).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    debug!(target_node = candidate.target_node, "Target not participating");
                    continue;
                }
                Err(e) => {
                    self.metrics.peer_failures.inc();
                    let target_node = candidate.target_node;
                    if e.is_routine() {
                        debug!(target_node, error = %e, "Target unreachable");
                    } else {
                        warn!(target_node, error = %e, "Target failed md query");
                    }
                    continue;
                }
            };

            if !predicate.accepts(candidate, &target) {
                debug!(
                    source_rn = %candidate.source_rn,
                    target_rn = %candidate.target_rn,
                    ptmd = target.ptmd(),
                    target_bmd = target.balanced_md,
                    "Candidate rejected"
                );
                continue;
            }

            let ptmd = target.ptmd();
            if let Some(transfer) = self.attempt(candidate, ptmd).await {
                return Some(transfer);
            }
        }
        None
    }

    /// Lease, initiate and, on failure, roll back one accepted candidate.
    async fn attempt(&self, candidate: &Transfer, ptmd: u32) -> Option<Transfer> {
        let remote_lease =
            MasterLeaseInfo::new(self.node_id, candidate.target_rn, ptmd, self.lease_duration);

        match self.peers.master_lease(candidate.target_node, remote_lease).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target_rn = %candidate.target_rn, "Lease denied");
                return None;
            }
            Err(e) => {
                self.metrics.peer_failures.inc();
                if e.is_routine() {
                    debug!(target_rn = %candidate.target_rn, error = %e, "Lease request failed");
                } else {
                    warn!(target_rn = %candidate.target_rn, error = %e, "Lease request faulted");
                }
                return None;
            }
        }

        let local_lease =
            MasterLeaseInfo::new(self.node_id, candidate.source_rn, ptmd, self.lease_duration);
        // Another negotiation on this node may have claimed the source
        // since it was ranked. Its lease stays.
        if !self.leases.acquire_exclusive(local_lease) {
            debug!(source_rn = %candidate.source_rn, "Source already in flight");
            self.release_remote(candidate).await;
            return None;
        }

        let started = self
            .initiator
            .initiate_master_transfer(candidate.source_rn, candidate.target_rn, self.lease_duration)
            .await;

        match started {
            Ok(true) => {
                self.metrics.transfers_initiated.inc();
                info!(
                    source_rn = %candidate.source_rn,
                    target_rn = %candidate.target_rn,
                    target_node = candidate.target_node,
                    ptmd,
                    "Master transfer initiated"
                );
                Some(Transfer {
                    ptmd,
                    ..*candidate
                })
            }
            Ok(false) => {
                debug!(source_rn = %candidate.source_rn, "Replication layer declined transfer");
                self.rollback(candidate).await;
                None
            }
            Err(e) => {
                if e.is_routine() {
                    debug!(source_rn = %candidate.source_rn, error = %e, "Transfer request failed");
                } else {
                    warn!(source_rn = %candidate.source_rn, error = %e, "Transfer request faulted");
                }
                self.rollback(candidate).await;
                None
            }
        }
    }

    async fn rollback(&self, candidate: &Transfer) {
        self.leases.cancel(candidate.source_rn);
        self.release_remote(candidate).await;
    }

    async fn release_remote(&self, candidate: &Transfer) {
        self.metrics.transfer_rollbacks.inc();
        if let Err(e) = self
            .peers
            .cancel_master_lease(candidate.target_node, self.node_id, candidate.target_rn)
            .await
        {
            // The remote lease expires on its own.
            debug!(target_rn = %candidate.target_rn, error = %e, "Remote lease cancel failed");
        }
    }
}
