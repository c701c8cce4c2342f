//! Short-lived master leases.
//!
//! A lease reserves one RN for an in-flight master transfer so the RN is not
//! picked twice concurrently. Leases expire on their own; expiry is the only
//! cleanup if a negotiating node crashes mid-handshake.

use crate::types::{MasterLeaseInfo, NodeId, RnId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct LeaseEntry {
    info: MasterLeaseInfo,
    expires_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

impl LeaseEntry {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Tracks leases held on RNs of this node.
///
/// Must be used from within a tokio runtime: every lease arms a timer task.
#[derive(Debug)]
pub struct LeaseManager {
    leases: Arc<DashMap<RnId, LeaseEntry>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

impl LeaseManager {
    /// Create an empty lease manager.
    pub fn new() -> Self {
        Self {
            leases: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Whether a live lease exists for `rn`.
    pub fn has_lease(&self, rn: RnId) -> bool {
        self.leases.get(&rn).map(|e| e.is_live()).unwrap_or(false)
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> u32 {
        self.leases.iter().filter(|e| e.is_live()).count() as u32
    }

    /// The live lease record for `rn`.
    pub fn lease(&self, rn: RnId) -> Option<MasterLeaseInfo> {
        self.leases
            .get(&rn)
            .filter(|e| e.is_live())
            .map(|e| e.info)
    }

    /// RNs with live leases.
    pub fn leased_rns(&self) -> Vec<RnId> {
        self.leases
            .iter()
            .filter(|e| e.is_live())
            .map(|e| *e.key())
            .collect()
    }

    /// Register a lease, or extend one the same node already holds.
    ///
    /// Returns false if another node holds a live lease on the RN or the
    /// manager has been shut down.
    pub fn acquire(&self, info: MasterLeaseInfo) -> bool {
        self.acquire_with(info, true)
    }

    /// Register a lease only if no live lease exists on the RN, whoever
    /// holds it.
    ///
    /// Used for the source side of a local transfer so two concurrent
    /// negotiations on this node cannot both claim the same master.
    pub fn acquire_exclusive(&self, info: MasterLeaseInfo) -> bool {
        self.acquire_with(info, false)
    }

    fn acquire_with(&self, info: MasterLeaseInfo, extend: bool) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }

        let rn = info.rn_id;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + info.duration();

        match self.leases.entry(rn) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_live() && current.info.requesting_node != info.requesting_node {
                    debug!(
                        %rn,
                        holder = current.info.requesting_node,
                        requester = info.requesting_node,
                        "Lease held by another node"
                    );
                    return false;
                }
                if current.is_live() && !extend {
                    debug!(%rn, holder = current.info.requesting_node, "Lease already held");
                    return false;
                }
                let timer = self.arm_timer(rn, generation, info);
                let old = occupied.insert(LeaseEntry {
                    info,
                    expires_at,
                    generation,
                    timer,
                });
                old.timer.abort();
                debug!(
                    %rn,
                    owner = info.requesting_node,
                    duration_ms = info.duration_ms,
                    "Lease extended"
                );
            }
            Entry::Vacant(vacant) => {
                let timer = self.arm_timer(rn, generation, info);
                vacant.insert(LeaseEntry {
                    info,
                    expires_at,
                    generation,
                    timer,
                });
                debug!(
                    %rn,
                    owner = info.requesting_node,
                    duration_ms = info.duration_ms,
                    "Lease acquired"
                );
            }
        }
        true
    }

    fn arm_timer(&self, rn: RnId, generation: u64, info: MasterLeaseInfo) -> JoinHandle<()> {
        let leases: Weak<DashMap<RnId, LeaseEntry>> = Arc::downgrade(&self.leases);
        let duration = info.duration();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(leases) = leases.upgrade() {
                // An extension replaces the entry with a newer generation.
                if leases
                    .remove_if(&rn, |_, e| e.generation == generation)
                    .is_some()
                {
                    debug!(%rn, owner = info.requesting_node, "Lease expired");
                }
            }
        })
    }

    /// Drop the lease on `rn`. Returns whether one was removed.
    pub fn cancel(&self, rn: RnId) -> bool {
        match self.leases.remove(&rn) {
            Some((_, entry)) => {
                entry.timer.abort();
                debug!(%rn, "Lease cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop the lease on `rn` only if `owner` holds it.
    ///
    /// Returns true when no lease on the RN remains afterwards, false if a
    /// different node still holds it.
    pub fn cancel_owned(&self, rn: RnId, owner: NodeId) -> bool {
        let removed = self.leases.remove_if(&rn, |_, e| {
            e.info.requesting_node == owner || !e.is_live()
        });
        match removed {
            Some((_, entry)) => {
                entry.timer.abort();
                debug!(%rn, owner, "Lease cancelled by owner");
                true
            }
            None => !self.leases.contains_key(&rn),
        }
    }

    /// Cancel all leases and refuse new ones.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.clear();
    }

    fn clear(&self) {
        let rns: Vec<RnId> = self.leases.iter().map(|e| *e.key()).collect();
        for rn in rns {
            if let Some((_, entry)) = self.leases.remove(&rn) {
                entry.timer.abort();
            }
        }
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lease(owner: NodeId, rn: RnId, secs: u64) -> MasterLeaseInfo {
        MasterLeaseInfo::new(owner, rn, 100, Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_cancel() {
        let manager = LeaseManager::new();
        let rn = RnId::new(1, 1);

        assert!(!manager.has_lease(rn));
        assert!(manager.acquire(lease(2, rn, 300)));
        assert!(manager.has_lease(rn));
        assert_eq!(manager.lease_count(), 1);
        assert_eq!(manager.lease(rn).unwrap().requesting_node, 2);

        assert!(manager.cancel(rn));
        assert!(!manager.has_lease(rn));
        // Idempotent
        assert!(!manager.cancel(rn));
        assert_eq!(manager.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_owner_denied() {
        let manager = LeaseManager::new();
        let rn = RnId::new(1, 1);

        assert!(manager.acquire(lease(2, rn, 300)));
        assert!(!manager.acquire(lease(3, rn, 300)));
        assert_eq!(manager.lease(rn).unwrap().requesting_node, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let manager = LeaseManager::new();
        let rn = RnId::new(1, 1);

        assert!(manager.acquire(lease(2, rn, 10)));
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert!(!manager.has_lease(rn));
        assert_eq!(manager.lease_count(), 0);
        // Expired leases do not block other owners.
        assert!(manager.acquire(lease(3, rn, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_owner_extends() {
        let manager = LeaseManager::new();
        let rn = RnId::new(1, 1);

        assert!(manager.acquire(lease(2, rn, 10)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.acquire(lease(2, rn, 10)));
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        // 12s after the first grant but only 6s after the extension.
        assert!(manager.has_lease(rn));

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(!manager.has_lease(rn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_refuses_same_owner() {
        let manager = LeaseManager::new();
        let rn = RnId::new(1, 1);

        assert!(manager.acquire_exclusive(lease(1, rn, 10)));
        assert!(!manager.acquire_exclusive(lease(1, rn, 10)));
        assert!(!manager.acquire_exclusive(lease(2, rn, 10)));

        // Free again once the first claim expires.
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(manager.acquire_exclusive(lease(1, rn, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_owned() {
        let manager = LeaseManager::new();
        let rn = RnId::new(1, 1);

        assert!(manager.acquire(lease(2, rn, 300)));
        assert!(!manager.cancel_owned(rn, 3));
        assert!(manager.has_lease(rn));
        assert!(manager.cancel_owned(rn, 2));
        assert!(!manager.has_lease(rn));
        assert!(manager.cancel_owned(rn, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_leases() {
        let manager = LeaseManager::new();
        assert!(manager.acquire(lease(2, RnId::new(1, 1), 300)));
        assert!(manager.acquire(lease(2, RnId::new(2, 1), 300)));

        manager.shutdown();
        assert_eq!(manager.lease_count(), 0);
        assert!(!manager.acquire(lease(2, RnId::new(3, 1), 300)));
    }
}
