//! In-process multi-node harness.
//!
//! Every node runs a real [`MasterBalance`]. Peer calls dispatch straight to
//! the target node's balance, and transfers are completed by pushing the
//! resulting role changes to both ends, the way the replication layer would.

use crate::balance::{DensityMonitor, MasterBalance};
use crate::cluster::{NoopShutdown, StaticTopology, Topology, TopologyProvider};
use crate::config::BalanceConfig;
use crate::error::{NetworkError, Result};
use crate::network::{MasterTransferInitiator, PeerClient};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId, ReplicationRole, RnId, StateInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Routes peer calls between in-process nodes.
#[derive(Debug, Default)]
pub struct InProcessNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<MasterBalance>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl InProcessNetwork {
    fn register(&self, node: NodeId, balance: Arc<MasterBalance>) {
        self.nodes.write().insert(node, balance);
    }

    /// Make `node` unreachable.
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    /// Make `node` reachable again.
    pub fn heal(&self, node: NodeId) {
        self.isolated.write().remove(&node);
    }

    fn route(&self, node: NodeId) -> Result<Arc<MasterBalance>> {
        if self.isolated.read().contains(&node) {
            return Err(NetworkError::Unreachable {
                node,
                reason: "isolated".to_string(),
            }
            .into());
        }
        self.nodes
            .read()
            .get(&node)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownNode(node).into())
    }
}

#[async_trait::async_trait]
impl PeerClient for InProcessNetwork {
    async fn note_state(&self, node: NodeId, info: StateInfo) -> Result<()> {
        self.route(node)?.note_state(info).await
    }

    async fn md_info(&self, node: NodeId) -> Result<Option<MdInfo>> {
        Ok(self.route(node)?.md_info())
    }

    async fn master_lease(&self, node: NodeId, lease: MasterLeaseInfo) -> Result<bool> {
        Ok(self.route(node)?.master_lease(lease))
    }

    async fn cancel_master_lease(
        &self,
        node: NodeId,
        requesting_node: NodeId,
        rn_id: RnId,
    ) -> Result<bool> {
        Ok(self.route(node)?.cancel_master_lease(requesting_node, rn_id))
    }

    async fn overloaded_neighbor(&self, node: NodeId, overloaded: NodeId) -> Result<()> {
        self.route(node)?.overloaded_neighbor(overloaded);
        Ok(())
    }
}

/// Stands in for the replication layer: accepts every transfer and reports
/// the role swap to both hosts.
#[derive(Debug)]
pub struct ClusterInitiator {
    topology: Arc<StaticTopology>,
    network: Arc<InProcessNetwork>,
    transfers: Mutex<Vec<(RnId, RnId)>>,
}

#[async_trait::async_trait]
impl MasterTransferInitiator for ClusterInitiator {
    async fn initiate_master_transfer(
        &self,
        source: RnId,
        target: RnId,
        _timeout: Duration,
    ) -> Result<bool> {
        let Some(topology) = self.topology.current() else {
            return Ok(false);
        };
        let (Some(source_node), Some(target_node)) =
            (topology.node_of(source), topology.node_of(target))
        else {
            return Ok(false);
        };
        self.transfers.lock().push((source, target));

        let network = self.network.clone();
        let seq = topology.seq();
        tokio::spawn(async move {
            let promoted = StateInfo::new(target, ReplicationRole::Master, seq);
            let demoted = StateInfo::new(source, ReplicationRole::Replica, seq);
            if let Err(e) = network.note_state(target_node, promoted).await {
                debug!(%target, error = %e, "Promotion not delivered");
            }
            if let Err(e) = network.note_state(source_node, demoted).await {
                debug!(%source, error = %e, "Demotion not delivered");
            }
        });
        Ok(true)
    }
}

/// A running set of nodes sharing one topology.
pub struct TestCluster {
    topology: Arc<StaticTopology>,
    network: Arc<InProcessNetwork>,
    initiator: Arc<ClusterInitiator>,
    nodes: BTreeMap<NodeId, Arc<MasterBalance>>,
}

impl TestCluster {
    /// Start balancing on every node of `topology`.
    pub fn start(topology: Topology, config: BalanceConfig) -> Result<Self> {
        let node_ids: Vec<NodeId> = topology.nodes().collect();
        let topology = Arc::new(StaticTopology::new(topology));
        let network = Arc::new(InProcessNetwork::default());
        let initiator = Arc::new(ClusterInitiator {
            topology: topology.clone(),
            network: network.clone(),
            transfers: Mutex::new(Vec::new()),
        });

        let mut nodes = BTreeMap::new();
        for node_id in node_ids {
            let balance = Arc::new(MasterBalance::start(
                node_id,
                config.clone(),
                topology.clone(),
                network.clone(),
                initiator.clone(),
                Arc::new(NoopShutdown),
            )?);
            network.register(node_id, balance.clone());
            nodes.insert(node_id, balance);
        }

        Ok(Self {
            topology,
            network,
            initiator,
            nodes,
        })
    }

    /// Get a node's balance.
    pub fn node(&self, node: NodeId) -> Option<&Arc<MasterBalance>> {
        self.nodes.get(&node)
    }

    /// Get a node's control loop, if balancing is enabled.
    pub fn monitor(&self, node: NodeId) -> Option<&Arc<DensityMonitor>> {
        self.nodes.get(&node).and_then(|b| b.monitor())
    }

    /// The shared network, for isolating nodes.
    pub fn network(&self) -> &Arc<InProcessNetwork> {
        &self.network
    }

    /// Transfers the replication layer was asked for, oldest first.
    pub fn transfers(&self) -> Vec<(RnId, RnId)> {
        self.initiator.transfers.lock().clone()
    }

    /// Report `role` for `rn` to the node hosting it.
    pub async fn set_role(&self, rn: RnId, role: ReplicationRole) -> Result<()> {
        let topology = self
            .topology
            .current()
            .ok_or_else(|| crate::error::Error::Topology("no topology".to_string()))?;
        let node = topology
            .node_of(rn)
            .ok_or_else(|| crate::error::Error::Topology(format!("{} not placed", rn)))?;
        // Local notifications do not cross the network.
        let balance = self
            .nodes
            .get(&node)
            .ok_or_else(|| crate::error::Error::Topology(format!("node {} not running", node)))?;
        balance
            .note_state(StateInfo::new(rn, role, topology.seq()))
            .await
    }

    /// Make each of `masters` the master of its group, every sibling a
    /// replica.
    pub async fn assign_masters(&self, masters: &[RnId]) -> Result<()> {
        let topology = self
            .topology
            .current()
            .ok_or_else(|| crate::error::Error::Topology("no topology".to_string()))?;
        for master in masters {
            for member in topology.group_members(master.group) {
                let role = if member == *master {
                    ReplicationRole::Master
                } else {
                    ReplicationRole::Replica
                };
                self.set_role(member, role).await?;
            }
        }
        Ok(())
    }

    /// Masters each node currently hosts.
    pub fn master_counts(&self) -> BTreeMap<NodeId, u32> {
        self.nodes
            .iter()
            .map(|(id, balance)| {
                let count = balance
                    .monitor()
                    .map(|m| m.resident().master_count())
                    .unwrap_or(0);
                (*id, count)
            })
            .collect()
    }

    /// Poll `check` until it holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, mut check: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }

    /// Stop every node.
    pub async fn shutdown(&self) {
        for balance in self.nodes.values() {
            balance.shutdown().await;
        }
    }
}
