//! Outbound side of the balancing contract.
//!
//! The control loop talks to peers only through [`PeerClient`] and to the
//! replication layer only through [`MasterTransferInitiator`], so the
//! algorithm can run against the TCP client in production and against
//! in-process fakes in tests.

use crate::config::BalanceConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{frame_message, read_frame, Message};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId, RnId, StateInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

/// Remote operations invoked on peer nodes.
///
/// Every call is awaited in place by the control loop; a slow peer stalls
/// the pass for at most the transport timeout.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Push a role change to `node`.
    async fn note_state(&self, node: NodeId, info: StateInfo) -> Result<()>;

    /// Fetch `node`'s density. `None` means the node is not participating.
    async fn md_info(&self, node: NodeId) -> Result<Option<MdInfo>>;

    /// Ask `node` for a lease on one of its replicas.
    async fn master_lease(&self, node: NodeId, lease: MasterLeaseInfo) -> Result<bool>;

    /// Release a lease previously granted by `node`.
    async fn cancel_master_lease(
        &self,
        node: NodeId,
        requesting_node: NodeId,
        rn_id: RnId,
    ) -> Result<bool>;

    /// Tell `node` that `overloaded` could not shed masters on its own.
    async fn overloaded_neighbor(&self, node: NodeId, overloaded: NodeId) -> Result<()>;
}

/// Entry point into the replication layer for handing off a master.
#[async_trait::async_trait]
pub trait MasterTransferInitiator: Send + Sync + 'static {
    /// Ask the local master `source` to hand mastership to `target`.
    ///
    /// Returns whether the replication layer accepted the request within
    /// `timeout`. Acceptance does not mean the transfer has completed; that
    /// is observed later as role-change notifications.
    async fn initiate_master_transfer(
        &self,
        source: RnId,
        target: RnId,
        timeout: Duration,
    ) -> Result<bool>;
}

/// [`PeerClient`] over the length-prefixed TCP contract.
///
/// Opens one connection per call.
#[derive(Debug)]
pub struct TcpPeerClient {
    /// This node's ID.
    node_id: NodeId,
    /// Known peer addresses.
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
    /// Timeout for one request/response exchange.
    rpc_timeout: Duration,
    /// Largest response accepted.
    max_message_size: usize,
}

impl TcpPeerClient {
    /// Create a new client.
    pub fn new(node_id: NodeId, config: &BalanceConfig) -> Self {
        Self {
            node_id,
            peers: RwLock::new(HashMap::new()),
            rpc_timeout: config.rpc_timeout,
            max_message_size: config.max_message_size,
        }
    }

    /// Register or update a peer address.
    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        self.peers.write().insert(node, addr);
    }

    /// Forget a peer.
    pub fn remove_peer(&self, node: NodeId) {
        self.peers.write().remove(&node);
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    async fn call(&self, node: NodeId, request: Message) -> Result<Message> {
        let addr = self
            .peers
            .read()
            .get(&node)
            .copied()
            .ok_or(NetworkError::UnknownNode(node))?;

        trace!(node, %addr, kind = request.kind(), "Sending request");

        let response = tokio::time::timeout(self.rpc_timeout, self.exchange(node, addr, &request))
            .await
            .map_err(|_| Error::Timeout)??;

        match response {
            Message::Error(reason) => Err(Error::Remote(reason)),
            other => Ok(other),
        }
    }

    async fn exchange(&self, node: NodeId, addr: SocketAddr, request: &Message) -> Result<Message> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::Unreachable {
                node,
                reason: e.to_string(),
            })?;

        let framed = frame_message(request)?;
        stream
            .write_all(&framed)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        read_frame(&mut stream, self.max_message_size)
            .await?
            .ok_or_else(|| NetworkError::ConnectionClosed.into())
    }
}

fn unexpected(response: Message) -> Error {
    NetworkError::UnexpectedResponse(response.kind().to_string()).into()
}

#[async_trait::async_trait]
impl PeerClient for TcpPeerClient {
    async fn note_state(&self, node: NodeId, info: StateInfo) -> Result<()> {
        match self.call(node, Message::NoteState(info)).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn md_info(&self, node: NodeId) -> Result<Option<MdInfo>> {
        let request = Message::GetMdInfo { from: self.node_id };
        match self.call(node, request).await? {
            Message::MdInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn master_lease(&self, node: NodeId, lease: MasterLeaseInfo) -> Result<bool> {
        match self.call(node, Message::GetMasterLease(lease)).await? {
            Message::LeaseGranted(granted) => Ok(granted),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel_master_lease(
        &self,
        node: NodeId,
        requesting_node: NodeId,
        rn_id: RnId,
    ) -> Result<bool> {
        let request = Message::CancelMasterLease {
            requesting_node,
            rn_id,
        };
        match self.call(node, request).await? {
            Message::LeaseCancelled(cancelled) => Ok(cancelled),
            other => Err(unexpected(other)),
        }
    }

    async fn overloaded_neighbor(&self, node: NodeId, overloaded: NodeId) -> Result<()> {
        let request = Message::OverloadedNeighbor {
            node_id: overloaded,
        };
        match self.call(node, request).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
