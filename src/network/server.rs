//! TCP server for inbound balancing requests.

use crate::balance::MasterBalance;
use crate::error::{NetworkError, Result};
use crate::network::rpc::{frame_message, read_frame, Message};
use crate::types::NodeId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Handler for incoming messages.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// Serves the remote contract from a node's [`MasterBalance`].
pub struct BalanceMessageHandler {
    balance: Arc<MasterBalance>,
}

impl BalanceMessageHandler {
    /// Create a handler over `balance`.
    pub fn new(balance: Arc<MasterBalance>) -> Self {
        Self { balance }
    }
}

#[async_trait::async_trait]
impl MessageHandler for BalanceMessageHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let response = match msg {
            Message::NoteState(info) => match self.balance.note_state(info).await {
                Ok(()) => Message::Ack,
                Err(e) => Message::Error(e.to_string()),
            },
            Message::GetMdInfo { from } => {
                debug!(from, "Serving md info");
                Message::MdInfo(self.balance.md_info())
            }
            Message::GetMasterLease(lease) => {
                Message::LeaseGranted(self.balance.master_lease(lease))
            }
            Message::CancelMasterLease {
                requesting_node,
                rn_id,
            } => {
                let cancelled = self.balance.cancel_master_lease(requesting_node, rn_id);
                Message::LeaseCancelled(cancelled)
            }
            Message::OverloadedNeighbor { node_id } => {
                self.balance.overloaded_neighbor(node_id);
                Message::Ack
            }
            other => {
                warn!(kind = other.kind(), "Unexpected message on balancing server");
                Message::Error(format!("unexpected message: {}", other.kind()))
            }
        };
        Some(response)
    }
}

/// TCP server for the balancing contract.
pub struct NetworkServer {
    /// Address to bind to.
    bind_addr: SocketAddr,

    /// This node's ID.
    node_id: NodeId,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Largest request accepted.
    max_message_size: usize,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Create a new network server.
    pub fn new(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            bind_addr,
            node_id,
            handler,
            max_message_size,
            shutdown_rx,
        };

        (server, shutdown_tx)
    }

    /// Bind and serve until the shutdown sender fires or is dropped.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().map_err(NetworkError::Io)?;
        info!(node_id = self.node_id, %addr, "Balancing server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max_size = self.max_message_size;
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, handler, max_size).await
                                {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(node_id = self.node_id, "Balancing server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_size: usize,
    ) -> Result<()> {
        while let Some(msg) = read_frame(&mut stream, max_size).await? {
            if let Some(response) = handler.handle(msg).await {
                let framed = frame_message(&response)?;
                stream
                    .write_all(&framed)
                    .await
                    .map_err(NetworkError::Io)?;
            }
        }
        // Connection closed
        Ok(())
    }
}
