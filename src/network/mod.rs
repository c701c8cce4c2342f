//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{MasterTransferInitiator, PeerClient, TcpPeerClient};
pub use rpc::Message;
pub use server::{BalanceMessageHandler, MessageHandler, NetworkServer};
