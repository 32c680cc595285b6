//! Durability request/response messages.
//!
//! Only control messages travel through send/receive; user data moves by
//! direct RDMA write into the server workspace. Messages are serialized with
//! bincode, whose default options encode integers as fixed-width
//! little-endian values.

use serde::{Deserialize, Serialize};

use crate::budget::RemoteCapacity;
use crate::error::{AofError, Result};
use crate::transport::RemoteRegion;

/// Largest encoded protocol message.
pub const MAX_MSG_SIZE: usize = 512;

/// Bytes per message buffer slot: an outgoing half and a receive half.
pub const IO_U_BUF_LEN: usize = 2 * MAX_MSG_SIZE;

/// Outcome of a durability request as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushStatus {
    /// The range is durable.
    Success,
    /// The requested range lies outside the workspace.
    RangeOutOfBounds,
    /// The persistence layer reported an error.
    PersistFailed,
}

impl FlushStatus {
    /// Returns true for [`FlushStatus::Success`].
    pub fn is_success(self) -> bool {
        self == FlushStatus::Success
    }
}

/// Client asks the server to make `[offset, offset + len)` durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushRequest {
    /// Echoed unchanged in the response.
    pub correlation_id: u64,
    /// Workspace offset of the range.
    pub offset: u64,
    /// Range length; zero means the whole workspace.
    pub len: u64,
}

/// Server acknowledgment of a [`FlushRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushResponse {
    /// Copied from the request.
    pub correlation_id: u64,
    /// Outcome of the flush.
    pub status: FlushStatus,
}

/// Every message the protocol exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client to server.
    FlushRequest(FlushRequest),
    /// Server to client.
    FlushResponse(FlushResponse),
}

impl Message {
    /// Encode the message, refusing anything that does not fit a slot half.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes =
            bincode::serialize(self).map_err(|e| AofError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_MSG_SIZE {
            return Err(AofError::Serialization(format!(
                "message of {} bytes exceeds {} byte limit",
                bytes.len(),
                MAX_MSG_SIZE
            )));
        }
        Ok(bytes)
    }

    /// Decode a message received into a slot.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| AofError::Serialization(e.to_string()))
    }

    /// Correlation id carried by either direction.
    pub fn correlation_id(&self) -> u64 {
        match self {
            Message::FlushRequest(req) => req.correlation_id,
            Message::FlushResponse(resp) => resp.correlation_id,
        }
    }
}

/// Largest correlation id; two low bits of a work request id carry its kind.
pub const MAX_CORRELATION_ID: u64 = (1 << 62) - 1;

/// What a posted work request was for, packed into its `wr_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkRequest {
    /// Client RDMA write of a request's data.
    Write(u64),
    /// Client send of a request's flush message.
    FlushSend(u64),
    /// Receive posted on the receive half of a slot.
    Recv(usize),
    /// Server send of a flush response out of a slot.
    Response(usize),
}

impl WorkRequest {
    /// Pack into a work request id.
    pub fn encode(self) -> u64 {
        match self {
            WorkRequest::Write(id) => id << 2,
            WorkRequest::FlushSend(id) => (id << 2) | 1,
            WorkRequest::Recv(slot) => ((slot as u64) << 2) | 2,
            WorkRequest::Response(slot) => ((slot as u64) << 2) | 3,
        }
    }

    /// Unpack a work request id taken from a completion.
    pub fn decode(wr_id: u64) -> Self {
        let value = wr_id >> 2;
        match wr_id & 3 {
            0 => WorkRequest::Write(value),
            1 => WorkRequest::FlushSend(value),
            2 => WorkRequest::Recv(value as usize),
            _ => WorkRequest::Response(value as usize),
        }
    }
}

/// Read-only workspace descriptor the server hands to its client at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerWorkspace {
    /// Target region for client RDMA writes.
    pub region: RemoteRegion,
    /// Durability requests the server can hold at once.
    pub max_msg_num: RemoteCapacity,
    /// Workspace size in bytes.
    pub size: u64,
}

impl ServerWorkspace {
    /// Encode as connection private data.
    pub fn to_private_data(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AofError::Serialization(e.to_string()))
    }

    /// Decode from connection private data.
    pub fn from_private_data(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| AofError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_encoding_is_fixed_width() {
        let small = Message::FlushRequest(FlushRequest {
            correlation_id: 1,
            offset: 0,
            len: 1,
        });
        let large = Message::FlushRequest(FlushRequest {
            correlation_id: u64::MAX >> 2,
            offset: u64::MAX,
            len: u64::MAX,
        });
        let a = small.encode().unwrap();
        let b = large.encode().unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), 4 + 3 * 8);
    }

    #[test]
    fn test_response_echoes_correlation_id() {
        let msg = Message::FlushResponse(FlushResponse {
            correlation_id: 0xABCD,
            status: FlushStatus::PersistFailed,
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.correlation_id(), 0xABCD);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = Message::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let bytes = Message::FlushRequest(FlushRequest {
            correlation_id: 5,
            offset: 64,
            len: 64,
        })
        .encode()
        .unwrap();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_workspace_private_data() {
        let ws = ServerWorkspace {
            region: RemoteRegion {
                rkey: 0x8000_0001,
                len: 1 << 20,
            },
            max_msg_num: RemoteCapacity(8),
            size: 1 << 20,
        };
        let bytes = ws.to_private_data().unwrap();
        assert_eq!(ServerWorkspace::from_private_data(&bytes).unwrap(), ws);
    }

    #[test]
    fn test_work_request_ids_do_not_collide() {
        let id = MAX_CORRELATION_ID;
        let kinds = [
            WorkRequest::Write(id),
            WorkRequest::FlushSend(id),
            WorkRequest::Recv(7),
            WorkRequest::Response(7),
        ];
        for kind in kinds {
            assert_eq!(WorkRequest::decode(kind.encode()), kind);
        }
        assert_ne!(
            WorkRequest::Write(3).encode(),
            WorkRequest::FlushSend(3).encode()
        );
    }

    #[test]
    fn test_slot_layout_constants() {
        assert_eq!(IO_U_BUF_LEN, 1024);
        assert!(IO_U_BUF_LEN >= 2 * MAX_MSG_SIZE);
    }
}
