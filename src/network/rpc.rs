//! RPC message types for the master balancing contract.

use crate::error::{self, NetworkError};
use crate::types::{MasterLeaseInfo, MdInfo, NodeId, RnId, StateInfo};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Network message wrapper for all balancing communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Push of an RN role change.
    NoteState(StateInfo),

    /// Ask for the callee's density snapshot.
    GetMdInfo {
        /// Asking node.
        from: NodeId,
    },

    /// Ask the callee to reserve one of its replicas for a transfer.
    GetMasterLease(MasterLeaseInfo),

    /// Release a lease the requester holds on the callee.
    CancelMasterLease {
        /// Node that holds the lease.
        requesting_node: NodeId,
        /// RN the lease is on.
        rn_id: RnId,
    },

    /// Tell the callee a neighbor is overloaded.
    OverloadedNeighbor {
        /// The overloaded node.
        node_id: NodeId,
    },

    /// Acknowledgement of a fire-and-forget request.
    Ack,

    /// Response to `GetMdInfo`; `None` if the callee is not participating.
    MdInfo(Option<MdInfo>),

    /// Response to `GetMasterLease`.
    LeaseGranted(bool),

    /// Response to `CancelMasterLease`.
    LeaseCancelled(bool),

    /// The callee failed internally while serving the request.
    Error(String),
}

impl Message {
    /// Short name of the message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NoteState(_) => "note_state",
            Message::GetMdInfo { .. } => "get_md_info",
            Message::GetMasterLease(_) => "get_master_lease",
            Message::CancelMasterLease { .. } => "cancel_master_lease",
            Message::OverloadedNeighbor { .. } => "overloaded_neighbor",
            Message::Ack => "ack",
            Message::MdInfo(_) => "md_info",
            Message::LeaseGranted(_) => "lease_granted",
            Message::LeaseCancelled(_) => "lease_cancelled",
            Message::Error(_) => "error",
        }
    }

    /// Check if this message is a request.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::NoteState(_)
                | Message::GetMdInfo { .. }
                | Message::GetMasterLease(_)
                | Message::CancelMasterLease { .. }
                | Message::OverloadedNeighbor { .. }
        )
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one length-prefixed message.
///
/// Returns `None` if the peer closed the connection before a new frame.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> error::Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    // Read message length (4 bytes)
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(NetworkError::ReceiveFailed(format!(
            "message too large: {} > {}",
            len, max_size
        ))
        .into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::Io)?;

    let msg = decode_message(&data)
        .map_err(|e| NetworkError::Deserialization(e.to_string()))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicationRole;
    use std::time::Duration;

    #[test]
    fn test_lease_request_serialization() {
        let lease = MasterLeaseInfo::new(3, RnId::new(2, 1), 66, Duration::from_secs(300));
        let encoded = encode_message(&Message::GetMasterLease(lease)).unwrap();
        let decoded = decode_message(&encoded).unwrap();

        if let Message::GetMasterLease(decoded) = decoded {
            assert_eq!(decoded, lease);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::NoteState(StateInfo::new(RnId::new(1, 2), ReplicationRole::Master, 9));

        let framed = frame_message(&msg).unwrap();

        // First 4 bytes should be length
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        let decoded = decode_message(&framed[4..]).unwrap();
        if let Message::NoteState(info) = decoded {
            assert_eq!(info.rn_id, RnId::new(1, 2));
            assert_eq!(info.topo_seq, 9);
        } else {
            panic!("Wrong message type");
        }
    }

    #[tokio::test]
    async fn test_read_frame() {
        let framed = frame_message(&Message::LeaseCancelled(true)).unwrap();
        let mut reader = &framed[..];
        let msg = read_frame(&mut reader, 1024).await.unwrap();
        assert!(matches!(msg, Some(Message::LeaseCancelled(true))));

        // Clean EOF after the frame
        let next = read_frame(&mut reader, 1024).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let framed = frame_message(&Message::Error("x".repeat(200))).unwrap();
        let mut reader = &framed[..];
        assert!(read_frame(&mut reader, 64).await.is_err());
    }

    #[test]
    fn test_request_classification() {
        assert!(Message::GetMdInfo { from: 1 }.is_request());
        assert!(!Message::Ack.is_request());
        assert!(!Message::MdInfo(None).is_request());
        assert_eq!(Message::LeaseGranted(true).kind(), "lease_granted");
    }
}
