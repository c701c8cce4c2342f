//! The master balancing capability as seen by the rest of the node.

use crate::balance::drain::DrainReport;
use crate::balance::monitor::DensityMonitor;
use crate::cluster::{ShutdownRequester, TopologyProvider};
use crate::config::BalanceConfig;
use crate::error::Result;
use crate::metrics::BalanceMetricsSnapshot;
use crate::network::{MasterTransferInitiator, PeerClient};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId, RnId, StateInfo};
use std::sync::Arc;
use tracing::info;

/// Master balancing for one node, enabled or turned off.
///
/// The disabled variant accepts every call and does nothing: it reports no
/// density, so peers never pick it as a target, and denies every lease.
#[derive(Debug)]
pub enum MasterBalance {
    /// Balancing runs.
    Enabled(Arc<DensityMonitor>),
    /// Balancing is turned off.
    Disabled,
}

impl MasterBalance {
    /// Validate `config` and start balancing if it is enabled.
    ///
    /// `owner` is asked to shut down if the control loop fails.
    pub fn start(
        node_id: NodeId,
        config: BalanceConfig,
        topology: Arc<dyn TopologyProvider>,
        peers: Arc<dyn PeerClient>,
        initiator: Arc<dyn MasterTransferInitiator>,
        owner: Arc<dyn ShutdownRequester>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.enabled {
            info!(node_id, "Master balancing disabled");
            return Ok(Self::Disabled);
        }

        let monitor = Arc::new(DensityMonitor::new(
            node_id, config, topology, peers, initiator,
        ));
        monitor.start(owner)?;
        Ok(Self::Enabled(monitor))
    }

    /// Check if balancing is running.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// The control loop, if enabled.
    pub fn monitor(&self) -> Option<&Arc<DensityMonitor>> {
        match self {
            Self::Enabled(monitor) => Some(monitor),
            Self::Disabled => None,
        }
    }

    /// Report a role change.
    pub async fn note_state(&self, info: StateInfo) -> Result<()> {
        match self {
            Self::Enabled(monitor) => monitor.note_state(info).await,
            Self::Disabled => Ok(()),
        }
    }

    /// Report that `rn` left the node.
    pub async fn note_exit(&self, rn: RnId) -> Result<()> {
        match self {
            Self::Enabled(monitor) => monitor.note_exit(rn).await,
            Self::Disabled => Ok(()),
        }
    }

    /// A neighbor asked us to try harder.
    pub fn overloaded_neighbor(&self, node: NodeId) {
        if let Self::Enabled(monitor) = self {
            monitor.overloaded_neighbor(node);
        }
    }

    /// This node's density; `None` means it does not take part.
    pub fn md_info(&self) -> Option<MdInfo> {
        match self {
            Self::Enabled(monitor) => monitor.md_info(),
            Self::Disabled => None,
        }
    }

    /// Serve a peer's lease request.
    pub fn master_lease(&self, lease: MasterLeaseInfo) -> bool {
        match self {
            Self::Enabled(monitor) => monitor.master_lease(lease),
            Self::Disabled => false,
        }
    }

    /// Release a peer's lease. Returns true when no lease on `rn` remains.
    pub fn cancel_master_lease(&self, requesting_node: NodeId, rn: RnId) -> bool {
        match self {
            Self::Enabled(monitor) => monitor.cancel_master_lease(requesting_node, rn),
            Self::Disabled => true,
        }
    }

    /// Move masters off the node ahead of shutdown.
    pub async fn drain_for_shutdown(&self) -> DrainReport {
        match self {
            Self::Enabled(monitor) => monitor.drain_for_shutdown().await,
            Self::Disabled => DrainReport::default(),
        }
    }

    /// Stop balancing. Idempotent.
    pub async fn shutdown(&self) {
        if let Self::Enabled(monitor) = self {
            monitor.shutdown().await;
        }
    }

    /// Metrics snapshot. All zero when disabled.
    pub fn metrics(&self) -> BalanceMetricsSnapshot {
        match self {
            Self::Enabled(monitor) => monitor.metrics().snapshot(),
            Self::Disabled => BalanceMetricsSnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NoopShutdown, StaticTopology};
    use crate::error::Error;
    use crate::testing::{RecordingInitiator, ScriptedPeers};
    use std::time::Duration;

    fn start(config: BalanceConfig) -> Result<MasterBalance> {
        MasterBalance::start(
            1,
            config,
            Arc::new(StaticTopology::empty()),
            Arc::new(ScriptedPeers::new()),
            Arc::new(RecordingInitiator::accepting()),
            Arc::new(NoopShutdown),
        )
    }

    #[tokio::test]
    async fn test_disabled_variant_is_inert() {
        let balance = start(BalanceConfig::disabled()).unwrap();
        assert!(!balance.is_enabled());
        assert!(balance.monitor().is_none());

        let rn = RnId::new(1, 1);
        balance.note_exit(rn).await.unwrap();
        balance.overloaded_neighbor(2);
        assert!(balance.md_info().is_none());
        assert!(!balance.master_lease(MasterLeaseInfo::new(2, rn, 100, Duration::from_secs(1))));
        assert!(balance.cancel_master_lease(2, rn));
        assert_eq!(balance.drain_for_shutdown().await, DrainReport::default());
        assert_eq!(balance.metrics(), BalanceMetricsSnapshot::default());
        balance.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = start(BalanceConfig::default().with_queue_capacity(0));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_enabled_lifecycle() {
        let balance = start(BalanceConfig::default()).unwrap();
        assert!(balance.is_enabled());
        // No topology yet.
        assert!(balance.md_info().is_none());

        balance.shutdown().await;
        balance.shutdown().await;
        assert!(balance.note_exit(RnId::new(1, 1)).await.is_err());
    }
}
