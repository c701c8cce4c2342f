//! Per-node master density control loop.
//!
//! ```text
//!   note_state() ──► bounded queue ──► control loop ──► ResidentRns snapshot
//!   (any task)       (cap 100)          │                   ▲
//!                                       │                   │ read-only
//!                                       ▼                   │
//!                          needs_rebalancing? ──► select ──► negotiate
//!                                                              │
//!   md_info() / master_lease() ◄── inbound peer RPCs ──────────┘
//! ```
//!
//! The loop task is the only writer of the resident master/replica sets. It
//! publishes a fresh [`ResidentRns`] after every applied notification so
//! concurrent RPC handlers read a consistent snapshot without holding a lock
//! across the loop's work.

use crate::balance::lease::LeaseManager;
use crate::balance::negotiator::{TransferNegotiator, TransferPredicate};
use crate::balance::policy::BalancePolicy;
use crate::balance::selector::{CandidateSelector, Transfer};
use crate::cluster::{ShutdownRequester, Topology, TopologyProvider};
use crate::config::BalanceConfig;
use crate::error::{Error, Result};
use crate::metrics::BalanceMetrics;
use crate::network::{MasterTransferInitiator, PeerClient};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId, ReplicationRole, RnId, StateInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Masters and replicas this node currently hosts, as last reported by the
/// replication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResidentRns {
    masters: BTreeSet<RnId>,
    replicas: BTreeSet<RnId>,
}

impl ResidentRns {
    /// Record `role` for `rn`.
    ///
    /// Unknown and detached RNs leave both sets.
    pub fn apply(&mut self, rn: RnId, role: ReplicationRole) {
        match role {
            ReplicationRole::Master => {
                self.replicas.remove(&rn);
                self.masters.insert(rn);
            }
            ReplicationRole::Replica => {
                self.masters.remove(&rn);
                self.replicas.insert(rn);
            }
            ReplicationRole::Unknown | ReplicationRole::Detached => {
                self.masters.remove(&rn);
                self.replicas.remove(&rn);
            }
        }
    }

    /// Check if `rn` is an active master here.
    pub fn is_master(&self, rn: RnId) -> bool {
        self.masters.contains(&rn)
    }

    /// Check if `rn` is an active replica here.
    pub fn is_replica(&self, rn: RnId) -> bool {
        self.replicas.contains(&rn)
    }

    /// Active masters in RN order.
    pub fn masters(&self) -> impl Iterator<Item = RnId> + '_ {
        self.masters.iter().copied()
    }

    /// Active replicas in RN order.
    pub fn replicas(&self) -> impl Iterator<Item = RnId> + '_ {
        self.replicas.iter().copied()
    }

    /// Number of active masters.
    pub fn master_count(&self) -> u32 {
        self.masters.len() as u32
    }

    /// Number of active replicas.
    pub fn replica_count(&self) -> u32 {
        self.replicas.len() as u32
    }
}

/// Entries on the notification queue.
#[derive(Debug)]
pub(crate) enum Notification {
    State(StateInfo),
    /// Wakes a loop blocked on an empty queue so it sees the shutdown token.
    Shutdown,
}

/// The master density control loop for one node.
pub struct DensityMonitor {
    pub(super) node_id: NodeId,
    pub(super) config: BalanceConfig,
    pub(super) topology: Arc<dyn TopologyProvider>,
    pub(super) peers: Arc<dyn PeerClient>,
    pub(super) initiator: Arc<dyn MasterTransferInitiator>,
    pub(super) leases: LeaseManager,
    pub(super) metrics: Arc<BalanceMetrics>,

    /// Published by the loop, read by everyone else.
    resident: RwLock<Arc<ResidentRns>>,

    queue_tx: mpsc::Sender<Notification>,
    /// Taken by the loop task on start.
    queue_rx: Mutex<Option<mpsc::Receiver<Notification>>>,

    /// Set by a neighbor, consumed by the next pass.
    overload: AtomicBool,
    pub(super) draining: AtomicBool,

    /// Guards the check-then-acquire of inbound lease requests.
    grant_lock: Mutex<()>,
    /// Held while a routine pass or a drain negotiates outbound transfers.
    pub(super) negotiation: tokio::sync::Mutex<()>,

    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl DensityMonitor {
    /// Create a monitor. Nothing runs until [`start`](Self::start).
    pub fn new(
        node_id: NodeId,
        config: BalanceConfig,
        topology: Arc<dyn TopologyProvider>,
        peers: Arc<dyn PeerClient>,
        initiator: Arc<dyn MasterTransferInitiator>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            node_id,
            config,
            topology,
            peers,
            initiator,
            leases: LeaseManager::new(),
            metrics: Arc::new(BalanceMetrics::new()),
            resident: RwLock::new(Arc::new(ResidentRns::default())),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            overload: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            grant_lock: Mutex::new(()),
            negotiation: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Get this node's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &Arc<BalanceMetrics> {
        &self.metrics
    }

    /// Local lease state.
    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Current snapshot of resident masters and replicas.
    pub fn resident(&self) -> Arc<ResidentRns> {
        self.resident.read().clone()
    }

    /// Check if the node is draining for shutdown.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Check if the monitor has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Notifications waiting to be applied.
    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Spawn the control loop and its supervisor.
    ///
    /// If the loop returns an error or panics, the supervisor logs it,
    /// stops the monitor, and asks `owner` to shut down.
    pub fn start(self: &Arc<Self>, owner: Arc<dyn ShutdownRequester>) -> Result<()> {
        let rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("density monitor already started".to_string()))?;

        let node_id = self.node_id;
        let token = self.shutdown.clone();
        let control_loop = tokio::spawn(self.clone().run(rx));

        let supervisor = tokio::spawn(async move {
            match control_loop.await {
                Ok(Ok(())) => debug!(node_id, "Density control loop exited"),
                Ok(Err(e)) => {
                    error!(node_id, error = %e, "Density control loop failed");
                    token.cancel();
                    owner.request_shutdown(&format!("master density control loop failed: {}", e));
                }
                Err(e) if e.is_cancelled() => debug!(node_id, "Density control loop aborted"),
                Err(e) => {
                    error!(node_id, error = %e, "Density control loop panicked");
                    token.cancel();
                    owner.request_shutdown("master density control loop panicked");
                }
            }
        });

        *self.supervisor.lock() = Some(supervisor);
        info!(node_id, "Master density monitor started");
        Ok(())
    }

    /// Stop the loop and cancel every lease. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(node_id = self.node_id, "Shutting down master density monitor");
        }
        self.shutdown.cancel();
        // The loop may be parked on an empty queue.
        let _ = self.queue_tx.try_send(Notification::Shutdown);
        self.leases.shutdown();

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }

    /// Queue a role change for the control loop.
    ///
    /// Blocks while the queue is full, warning every enqueue timeout, and
    /// never drops the notification. Fails only once the monitor stops.
    pub async fn note_state(&self, info: StateInfo) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut pending = Notification::State(info);
        loop {
            match self
                .queue_tx
                .send_timeout(pending, self.config.enqueue_timeout)
                .await
            {
                Ok(()) => {
                    self.metrics.queue_depth.set(self.queue_depth() as i64);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    warn!(
                        node_id = self.node_id,
                        rn_id = %info.rn_id,
                        role = %info.role,
                        timeout_ms = self.config.enqueue_timeout.as_millis() as u64,
                        "Notification queue full, control loop may be stuck; retrying"
                    );
                    if self.shutdown.is_cancelled() {
                        return Err(Error::ShuttingDown);
                    }
                    pending = returned;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(Error::ShuttingDown),
            }
        }
    }

    /// Queue a detached notification for `rn`.
    pub async fn note_exit(&self, rn: RnId) -> Result<()> {
        self.note_state(StateInfo::detached(rn)).await
    }

    /// A neighbor could not shed masters; try harder on the next pass.
    pub fn overloaded_neighbor(&self, node: NodeId) {
        debug!(node_id = self.node_id, overloaded = node, "Neighbor reported overload");
        self.metrics.overload_alerts_received.inc();
        self.overload.store(true, Ordering::Release);
    }

    /// This node's density, or `None` if it has no topology or no RNs.
    pub fn md_info(&self) -> Option<MdInfo> {
        let topology = self.topology.current()?;
        self.md_info_with(&topology)
    }

    fn md_info_with(&self, topology: &Topology) -> Option<MdInfo> {
        let policy = BalancePolicy::new(topology, self.node_id);
        let rn_count = policy.rn_count();
        if rn_count == 0 {
            return None;
        }
        let resident = self.resident();
        // Masters the topology does not place here yet stay out of the
        // exported density.
        let placed_masters = resident
            .masters()
            .filter(|rn| topology.node_of(*rn) == Some(self.node_id))
            .count() as u32;
        Some(MdInfo {
            master_count: placed_masters,
            master_lease_count: self.incoming_lease_count(&resident),
            rn_count,
            balanced_md: policy.bmd(),
        })
    }

    /// Leases granted to peers on our replicas.
    fn incoming_lease_count(&self, resident: &ResidentRns) -> u32 {
        self.leases
            .leased_rns()
            .into_iter()
            .filter(|rn| !resident.is_master(*rn))
            .count() as u32
    }

    /// Leases we hold on our own masters while handing them off.
    fn outgoing_lease_count(&self, resident: &ResidentRns) -> u32 {
        self.leases
            .leased_rns()
            .into_iter()
            .filter(|rn| resident.is_master(*rn))
            .count() as u32
    }

    /// Serve a peer's lease request on one of our replicas.
    pub fn master_lease(&self, lease: MasterLeaseInfo) -> bool {
        let granted = {
            let _gate = self.grant_lock.lock();
            self.check_and_grant(lease)
        };
        if granted {
            self.metrics.leases_granted.inc();
        } else {
            self.metrics.leases_denied.inc();
        }
        granted
    }

    fn check_and_grant(&self, lease: MasterLeaseInfo) -> bool {
        let rn = lease.rn_id;
        let requester = lease.requesting_node;

        if self.is_draining() {
            debug!(%rn, requester, "Lease denied: node is draining");
            return false;
        }

        if let Some(existing) = self.leases.lease(rn) {
            if existing.requesting_node != requester {
                debug!(
                    %rn,
                    requester,
                    holder = existing.requesting_node,
                    "Lease denied: held by another node"
                );
                return false;
            }
            // Already counted in our density.
            return self.leases.acquire(lease);
        }

        let resident = self.resident();
        if resident.is_master(rn) {
            debug!(%rn, requester, "Lease denied: already master");
            return false;
        }
        if !resident.is_replica(rn) {
            debug!(%rn, requester, "Lease denied: not an active replica");
            return false;
        }

        let Some(info) = self.md_info() else {
            debug!(%rn, requester, "Lease denied: no topology");
            return false;
        };
        if info.ptmd() > lease.density_limit {
            debug!(
                %rn,
                requester,
                ptmd = info.ptmd(),
                limit = lease.density_limit,
                "Lease denied: density limit exceeded"
            );
            return false;
        }

        self.leases.acquire(lease)
    }

    /// Release a lease held by `requesting_node`.
    ///
    /// Returns true when no lease on `rn` remains.
    pub fn cancel_master_lease(&self, requesting_node: NodeId, rn: RnId) -> bool {
        self.leases.cancel_owned(rn, requesting_node)
    }

    /// Whether the node currently has more masters than it should.
    ///
    /// Reads the overload flag without consuming it.
    pub fn needs_rebalancing(&self) -> bool {
        let Some(topology) = self.topology.current() else {
            return false;
        };
        let overload = self.overload.load(Ordering::Acquire);
        self.evaluate(&topology, &self.resident(), overload)
    }

    fn evaluate(&self, topology: &Topology, resident: &ResidentRns, overload: bool) -> bool {
        let masters = resident.master_count();
        let policy = BalancePolicy::new(topology, self.node_id);
        let rn_count = policy.rn_count();
        if masters == 0 || rn_count == 0 {
            return false;
        }

        let leases = i64::from(self.outgoing_lease_count(resident));
        let rn_count = i64::from(rn_count);
        let lease_adjusted_md = (i64::from(masters) - leases) * 100 / rn_count;
        let bmd = i64::from(policy.bmd());

        // A node allowed any masters keeps its last one.
        if lease_adjusted_md > bmd && (bmd == 0 || masters > 1) {
            return true;
        }
        overload && lease_adjusted_md + 100 / rn_count > bmd
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Notification>) -> Result<()> {
        let node_id = self.node_id;
        debug!(
            node_id,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Density control loop running"
        );

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                polled = tokio::time::timeout(self.config.poll_interval, rx.recv()) => polled,
            };

            match polled {
                Ok(Some(Notification::State(info))) => self.apply(info),
                Ok(Some(Notification::Shutdown)) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                }
                Ok(None) => {
                    return Err(Error::Internal("notification queue closed".to_string()));
                }
                // Poll interval elapsed with nothing queued.
                Err(_) => {}
            }
            self.metrics.queue_depth.set(self.queue_depth() as i64);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.rebalance_pass() => {}
            }
        }

        info!(node_id, "Master density monitor stopped");
        Ok(())
    }

    /// Move the RN between the resident sets and drop its lease.
    pub(crate) fn apply(&self, info: StateInfo) {
        if let Some(topology) = self.topology.current() {
            if topology.node_of(info.rn_id) != Some(self.node_id) {
                // Heard before the topology caught up.
                debug!(
                    node_id = self.node_id,
                    rn_id = %info.rn_id,
                    topo_seq = info.topo_seq,
                    local_seq = topology.seq(),
                    "State change for RN not placed here by current topology"
                );
            }
        }

        let snapshot = {
            let mut resident = self.resident.write();
            let mut next = ResidentRns::clone(&resident);
            next.apply(info.rn_id, info.role);
            let next = Arc::new(next);
            *resident = next.clone();
            next
        };
        self.leases.cancel(info.rn_id);

        self.metrics.active_masters.set(i64::from(snapshot.master_count()));
        self.metrics.active_replicas.set(i64::from(snapshot.replica_count()));
        debug!(
            node_id = self.node_id,
            rn_id = %info.rn_id,
            role = %info.role,
            "Applied state change"
        );
    }

    pub(super) fn negotiator(&self) -> TransferNegotiator<'_> {
        TransferNegotiator::new(
            self.node_id,
            self.peers.as_ref(),
            self.initiator.as_ref(),
            &self.leases,
            self.config.lease_duration,
            &self.metrics,
        )
    }

    /// One evaluation of local density, transferring at most one master.
    pub(crate) async fn rebalance_pass(&self) -> Option<Transfer> {
        let _negotiating = self.negotiation.lock().await;
        if self.is_draining() {
            return None;
        }
        let Some(topology) = self.topology.current() else {
            debug!(node_id = self.node_id, "No topology yet, skipping rebalance");
            return None;
        };
        // Left set until a pass can act on it.
        let overload = self.overload.swap(false, Ordering::AcqRel);

        self.metrics.rebalance_passes.inc();
        let resident = self.resident();
        if !self.evaluate(&topology, &resident, overload) {
            return None;
        }
        self.metrics.rebalance_needed.inc();

        let policy = BalancePolicy::new(&topology, self.node_id);
        let rn_count = policy.rn_count();
        let masters = resident.master_count();
        let selector = CandidateSelector::new(self.node_id, &topology, self.peers.as_ref());

        let sources = CandidateSelector::eligible_masters(resident.masters(), &self.leases);
        let pool = selector.candidate_pool(&sources);
        let ranked = selector.rank_pool(&pool).await;
        let lowered_md = CandidateSelector::lowered_md(
            masters,
            self.outgoing_lease_count(&resident),
            rn_count,
            overload,
        );
        let candidates = selector.build_candidates(&ranked, &sources, Some(lowered_md));
        debug!(
            node_id = self.node_id,
            masters,
            rn_count,
            pool = pool.len(),
            ranked = ranked.len(),
            candidates = candidates.len(),
            lowered_md,
            overload,
            "Node needs rebalancing"
        );

        let predicate = TransferPredicate::Routine {
            source_affinity: policy.local_affinity(),
        };
        let transfer = self.negotiator().negotiate(&candidates, predicate).await;

        if transfer.is_none() && self.leases.lease_count() == 0 {
            let md = masters * 100 / rn_count;
            if md > policy.current_affinity_bmd() {
                self.alert_overload(pool.into_iter().collect());
            }
        }
        transfer
    }

    /// Tell every pool peer we are stuck. Fire-and-forget.
    fn alert_overload(&self, neighbors: Vec<NodeId>) {
        if neighbors.is_empty() {
            return;
        }
        let node_id = self.node_id;
        info!(node_id, neighbors = neighbors.len(), "Unable to shed masters, alerting neighbors");

        let peers = self.peers.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            for neighbor in neighbors {
                match peers.overloaded_neighbor(neighbor, node_id).await {
                    Ok(()) => metrics.overload_alerts_sent.inc(),
                    Err(e) => debug!(node_id, neighbor, error = %e, "Overload alert not delivered"),
                }
            }
        });
    }
}

impl std::fmt::Debug for DensityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DensityMonitor")
            .field("node_id", &self.node_id)
            .field("resident", &self.resident())
            .field("leases", &self.leases.lease_count())
            .field("draining", &self.is_draining())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
