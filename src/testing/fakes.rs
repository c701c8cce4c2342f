//! Scripted collaborators for driving the balancer without a cluster.

use crate::cluster::ShutdownRequester;
use crate::error::{Error, NetworkError, Result};
use crate::network::{MasterTransferInitiator, PeerClient};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId, RnId, StateInfo};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Default)]
struct ScriptState {
    md_info: HashMap<NodeId, Option<MdInfo>>,
    unreachable: HashSet<NodeId>,
    faulty: HashSet<NodeId>,
    denying: HashSet<NodeId>,
    granted: Vec<(NodeId, RnId)>,
    cancelled: Vec<(NodeId, RnId)>,
    alerts: Vec<(NodeId, NodeId)>,
    yielding: bool,
}

/// [`PeerClient`] whose answers are set up front.
///
/// Nodes without a scripted density answer with an unknown-node error.
/// Leases are granted unless the node is set to deny them.
#[derive(Debug, Default)]
pub struct ScriptedPeers {
    state: Mutex<ScriptState>,
}

impl ScriptedPeers {
    /// Create peers with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `md_info` for `node` with `info`.
    pub fn set_md_info(&self, node: NodeId, info: Option<MdInfo>) {
        let mut state = self.state.lock();
        state.unreachable.remove(&node);
        state.faulty.remove(&node);
        state.md_info.insert(node, info);
    }

    /// Fail every call to `node` as unreachable.
    pub fn set_unreachable(&self, node: NodeId) {
        self.state.lock().unreachable.insert(node);
    }

    /// Fail every call to `node` with a remote fault.
    pub fn set_faulty(&self, node: NodeId) {
        self.state.lock().faulty.insert(node);
    }

    /// Deny every lease request to `node`.
    pub fn deny_leases(&self, node: NodeId) {
        self.state.lock().denying.insert(node);
    }

    /// Leases granted and not cancelled, as `(node, rn)`.
    pub fn granted_leases(&self) -> Vec<(NodeId, RnId)> {
        self.state.lock().granted.clone()
    }

    /// Lease cancellations received, as `(node, rn)`.
    pub fn cancelled_leases(&self) -> Vec<(NodeId, RnId)> {
        self.state.lock().cancelled.clone()
    }

    /// Overload alerts received, as `(node, overloaded)`.
    pub fn overload_alerts(&self) -> Vec<(NodeId, NodeId)> {
        self.state.lock().alerts.clone()
    }

    /// Yield to the runtime at the start of every call, like a real
    /// network round trip would.
    pub fn set_yielding(&self) {
        self.state.lock().yielding = true;
    }

    async fn check(&self, node: NodeId) -> Result<()> {
        let yielding = self.state.lock().yielding;
        if yielding {
            tokio::task::yield_now().await;
        }
        let state = self.state.lock();
        if state.unreachable.contains(&node) {
            return Err(NetworkError::Unreachable {
                node,
                reason: "scripted".to_string(),
            }
            .into());
        }
        if state.faulty.contains(&node) {
            return Err(Error::Remote(format!("node {} scripted fault", node)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerClient for ScriptedPeers {
    async fn note_state(&self, node: NodeId, _info: StateInfo) -> Result<()> {
        self.check(node).await
    }

    async fn md_info(&self, node: NodeId) -> Result<Option<MdInfo>> {
        self.check(node).await?;
        self.state
            .lock()
            .md_info
            .get(&node)
            .copied()
            .ok_or_else(|| NetworkError::UnknownNode(node).into())
    }

    async fn master_lease(&self, node: NodeId, lease: MasterLeaseInfo) -> Result<bool> {
        self.check(node).await?;
        let mut state = self.state.lock();
        if state.denying.contains(&node) {
            return Ok(false);
        }
        state.granted.push((node, lease.rn_id));
        Ok(true)
    }

    async fn cancel_master_lease(
        &self,
        node: NodeId,
        _requesting_node: NodeId,
        rn_id: RnId,
    ) -> Result<bool> {
        self.check(node).await?;
        let mut state = self.state.lock();
        state.granted.retain(|held| *held != (node, rn_id));
        state.cancelled.push((node, rn_id));
        Ok(true)
    }

    async fn overloaded_neighbor(&self, node: NodeId, overloaded: NodeId) -> Result<()> {
        self.check(node).await?;
        self.state.lock().alerts.push((node, overloaded));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorMode {
    Accept,
    Decline,
    Fail,
    Panic,
}

/// [`MasterTransferInitiator`] that records requests and answers with a
/// fixed outcome.
#[derive(Debug)]
pub struct RecordingInitiator {
    mode: InitiatorMode,
    calls: Mutex<Vec<(RnId, RnId)>>,
}

impl RecordingInitiator {
    fn with_mode(mode: InitiatorMode) -> Self {
        Self {
            mode,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Accept every transfer.
    pub fn accepting() -> Self {
        Self::with_mode(InitiatorMode::Accept)
    }

    /// Decline every transfer.
    pub fn declining() -> Self {
        Self::with_mode(InitiatorMode::Decline)
    }

    /// Fail every transfer with a timeout.
    pub fn failing() -> Self {
        Self::with_mode(InitiatorMode::Fail)
    }

    /// Panic on the first transfer.
    pub fn panicking() -> Self {
        Self::with_mode(InitiatorMode::Panic)
    }

    /// Requests seen, as `(source, target)`.
    pub fn calls(&self) -> Vec<(RnId, RnId)> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl MasterTransferInitiator for RecordingInitiator {
    async fn initiate_master_transfer(
        &self,
        source: RnId,
        target: RnId,
        _timeout: Duration,
    ) -> Result<bool> {
        self.calls.lock().push((source, target));
        match self.mode {
            InitiatorMode::Accept => Ok(true),
            InitiatorMode::Decline => Ok(false),
            InitiatorMode::Fail => Err(Error::Timeout),
            InitiatorMode::Panic => panic!("scripted initiator panic"),
        }
    }
}

/// [`ShutdownRequester`] that records the reasons it was given.
#[derive(Debug, Default)]
pub struct RecordingShutdown {
    reasons: Mutex<Vec<String>>,
}

impl RecordingShutdown {
    /// Create a recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons received, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl ShutdownRequester for RecordingShutdown {
    fn request_shutdown(&self, reason: &str) {
        self.reasons.lock().push(reason.to_string());
    }
}
