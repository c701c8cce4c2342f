//! Error types for the master-density layer.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type alias for balancing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the balancing layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A peer answered with an internal application fault.
    #[error("remote error: {0}")]
    Remote(String),

    /// The topology is missing or inconsistent.
    #[error("topology error: {0}")]
    Topology(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The balancing layer is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is an expected network condition.
    ///
    /// Routine errors are logged at debug and the affected peer skipped.
    /// Everything else a peer returns is a fault worth a warning.
    pub fn is_routine(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The peer could not be reached.
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    /// No address is known for the node.
    #[error("no address for node {0}")]
    UnknownNode(NodeId),

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer answered with a response of the wrong kind.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routine_classification() {
        let unreachable = Error::from(NetworkError::Unreachable {
            node: 7,
            reason: "connection refused".into(),
        });
        assert!(unreachable.is_routine());
        assert!(Error::Timeout.is_routine());
        assert!(!Error::Remote("boom".into()).is_routine());
        assert!(!Error::Topology("gone".into()).is_routine());
    }

    #[test]
    fn test_display() {
        let err = Error::from(NetworkError::UnknownNode(4));
        assert_eq!(err.to_string(), "network error: no address for node 4");
    }
}
