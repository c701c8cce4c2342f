//! Multi-node balancing scenarios.

use crate::balance::MasterBalance;
use crate::cluster::{StaticTopology, Topology, ZoneInfo};
use crate::config::BalanceConfig;
use crate::error::Error;
use crate::network::{BalanceMessageHandler, NetworkServer, TcpPeerClient};
use crate::testing::{
    init_tracing, RecordingInitiator, RecordingShutdown, ScriptedPeers, TestCluster,
};
use crate::types::{MasterLeaseInfo, MdInfo, ReplicationRole, RnId, StateInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> BalanceConfig {
    BalanceConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_drain_poll_interval(Duration::from_millis(20))
        .with_drain_timeout(Duration::from_secs(2))
}

/// `groups` groups of three, member m of every group on node m.
fn three_node_topology(groups: u32) -> Topology {
    let mut builder = Topology::builder(1)
        .zone(ZoneInfo::primary(1, 3))
        .node(1, 1)
        .node(2, 1)
        .node(3, 1);
    for group in 1..=groups {
        for member in 1..=3 {
            builder = builder.rn(RnId::new(group, member), u64::from(member));
        }
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_masters_spread_across_nodes() {
    init_tracing();
    let cluster = TestCluster::start(three_node_topology(3), fast_config()).unwrap();

    // Every group starts with its master on node 1.
    let masters: Vec<_> = (1..=3).map(|g| RnId::new(g, 1)).collect();
    cluster.assign_masters(&masters).await.unwrap();

    let balanced = cluster
        .wait_until(WAIT, |c| c.master_counts().values().all(|&n| n == 1))
        .await;
    assert!(balanced, "master counts: {:?}", cluster.master_counts());
    assert_eq!(cluster.transfers().len(), 2);

    // Nothing further moves once balanced.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.transfers().len(), 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_drain_moves_masters_off() {
    init_tracing();
    let cluster = TestCluster::start(three_node_topology(3), fast_config()).unwrap();
    let masters = [RnId::new(1, 1), RnId::new(2, 2), RnId::new(3, 3)];
    cluster.assign_masters(&masters).await.unwrap();
    assert!(
        cluster
            .wait_until(WAIT, |c| c.master_counts().values().all(|&n| n == 1))
            .await
    );

    let report = cluster.node(1).unwrap().drain_for_shutdown().await;
    assert_eq!(report.initiated.len(), 1);
    assert_eq!(report.completed, vec![RnId::new(1, 1)]);
    assert!(report.is_clean());
    assert_eq!(cluster.master_counts()[&1], 0);

    // Peers cannot hand masters back to a draining node.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.master_counts()[&1], 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_peer_is_skipped() {
    init_tracing();
    let cluster = TestCluster::start(three_node_topology(3), fast_config()).unwrap();
    cluster.network().isolate(2);

    let masters: Vec<_> = (1..=3).map(|g| RnId::new(g, 1)).collect();
    cluster.assign_masters(&masters).await.unwrap();

    // Only node 3 is reachable and it takes one master.
    assert!(
        cluster
            .wait_until(WAIT, |c| c.master_counts()[&3] == 1)
            .await
    );
    assert!(cluster.transfers().iter().all(|(_, target)| target.member == 3));

    cluster.network().heal(2);
    assert!(
        cluster
            .wait_until(WAIT, |c| c.master_counts().values().all(|&n| n == 1))
            .await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lease_cleared_by_replica_notification() {
    init_tracing();
    let cluster = TestCluster::start(three_node_topology(1), fast_config()).unwrap();
    let rn = RnId::new(1, 2);
    cluster.assign_masters(&[RnId::new(1, 1)]).await.unwrap();

    let node = cluster.node(2).unwrap();
    assert!(
        cluster
            .wait_until(WAIT, |c| c.monitor(2).unwrap().resident().is_replica(rn))
            .await
    );
    let lease = MasterLeaseInfo::new(1, rn, 100, Duration::from_millis(300_000));
    assert!(node.master_lease(lease));

    node.note_state(StateInfo::new(rn, ReplicationRole::Replica, 1))
        .await
        .unwrap();
    assert!(
        cluster
            .wait_until(WAIT, |c| !c.monitor(2).unwrap().leases().has_lease(rn))
            .await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stale_topology_notification_tolerated() {
    init_tracing();
    let cluster = TestCluster::start(three_node_topology(1), fast_config()).unwrap();
    let node = cluster.node(1).unwrap();

    // rg9 is not in the topology yet.
    let unknown = RnId::new(9, 1);
    node.note_state(StateInfo::new(unknown, ReplicationRole::Master, 2))
        .await
        .unwrap();
    assert!(
        cluster
            .wait_until(WAIT, |c| c.monitor(1).unwrap().resident().is_master(unknown))
            .await
    );
    let info = node.md_info().unwrap();
    assert_eq!(info.rn_count, 1);
    assert_eq!(info.master_count, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_fatal_loop_error_requests_owner_shutdown() {
    init_tracing();
    let topology = three_node_topology(3);
    let peers = Arc::new(ScriptedPeers::new());
    let roomy = MdInfo {
        master_count: 0,
        master_lease_count: 0,
        rn_count: 3,
        balanced_md: 33,
    };
    peers.set_md_info(2, Some(roomy));
    peers.set_md_info(3, Some(roomy));
    let owner = Arc::new(RecordingShutdown::new());

    let balance = MasterBalance::start(
        1,
        fast_config(),
        Arc::new(StaticTopology::new(topology)),
        peers,
        Arc::new(RecordingInitiator::panicking()),
        owner.clone(),
    )
    .unwrap();

    for group in 1..=3 {
        // The loop may already have died on an earlier notification.
        let _ = balance
            .note_state(StateInfo::new(RnId::new(group, 1), ReplicationRole::Master, 1))
            .await;
    }

    let mut requested = false;
    for _ in 0..500 {
        if !owner.reasons().is_empty() {
            requested = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(requested, "owner shutdown was not requested");
    assert!(owner.reasons()[0].contains("panicked"));

    let result = balance
        .note_state(StateInfo::new(RnId::new(1, 1), ReplicationRole::Replica, 1))
        .await;
    assert!(matches!(result, Err(Error::ShuttingDown)));
}

#[tokio::test]
async fn test_transfer_over_tcp() {
    init_tracing();
    // Two nodes, two groups of two: node 1 starts with both masters.
    let topology = || {
        Topology::builder(1)
            .zone(ZoneInfo::primary(1, 2))
            .node(1, 1)
            .node(2, 1)
            .rn(RnId::new(1, 1), 1)
            .rn(RnId::new(1, 2), 2)
            .rn(RnId::new(2, 1), 1)
            .rn(RnId::new(2, 2), 2)
            .build()
            .unwrap()
    };
    let config = fast_config();

    let client_1 = Arc::new(TcpPeerClient::new(1, &config));
    let client_2 = Arc::new(TcpPeerClient::new(2, &config));
    let initiator = Arc::new(RecordingInitiator::accepting());

    let node_1 = Arc::new(
        MasterBalance::start(
            1,
            config.clone(),
            Arc::new(StaticTopology::new(topology())),
            client_1.clone(),
            initiator.clone(),
            Arc::new(RecordingShutdown::new()),
        )
        .unwrap(),
    );
    let node_2 = Arc::new(
        MasterBalance::start(
            2,
            config.clone(),
            Arc::new(StaticTopology::new(topology())),
            client_2.clone(),
            Arc::new(RecordingInitiator::accepting()),
            Arc::new(RecordingShutdown::new()),
        )
        .unwrap(),
    );

    let mut shutdowns = Vec::new();
    for (node_id, balance, client) in [(1, &node_1, &client_2), (2, &node_2, &client_1)] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(BalanceMessageHandler::new(balance.clone()));
        let (server, shutdown_tx) =
            NetworkServer::new(addr, node_id, handler, config.max_message_size);
        tokio::spawn(server.serve(listener));
        client.add_peer(node_id, addr);
        shutdowns.push(shutdown_tx);
    }

    node_2
        .note_state(StateInfo::new(RnId::new(1, 2), ReplicationRole::Replica, 1))
        .await
        .unwrap();
    node_2
        .note_state(StateInfo::new(RnId::new(2, 2), ReplicationRole::Replica, 1))
        .await
        .unwrap();
    node_1
        .note_state(StateInfo::new(RnId::new(1, 1), ReplicationRole::Master, 1))
        .await
        .unwrap();
    node_1
        .note_state(StateInfo::new(RnId::new(2, 1), ReplicationRole::Master, 1))
        .await
        .unwrap();

    let mut initiated = false;
    for _ in 0..500 {
        if !initiator.calls().is_empty() {
            initiated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(initiated, "no transfer initiated");

    let (source, target) = initiator.calls()[0];
    assert_eq!(source.member, 1);
    assert_eq!(target.member, 2);
    assert!(source.same_group(&target));
    // Node 2 holds the lease until the promotion is reported.
    assert_eq!(node_2.md_info().unwrap().master_lease_count, 1);
    assert_eq!(node_1.metrics().transfers_initiated, 1);

    for shutdown_tx in shutdowns {
        let _ = shutdown_tx.send(()).await;
    }
    node_1.shutdown().await;
    node_2.shutdown().await;
}
