//! Binary wire protocol for canvas synchronization.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ doc_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! One logical duplex channel per client↔relay connection multiplexes two
//! message kinds — document deltas and awareness updates — plus the
//! admission handshake and heartbeats. The channel is FIFO per sender;
//! no cross-sender ordering is promised (the document merge does not need
//! one).
//!
//! Payload encodings: join/delta payloads are JSON (they carry schemaless
//! node `data` and state-vector maps); awareness payloads are bincode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Delta, StateVector};
use crate::presence::AwarenessMessage;

/// Message types multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Room admission request (first frame on every connection).
    Join = 1,
    /// Admission response: accepted + missing deltas, or a refusal.
    JoinAck = 2,
    /// Incremental document delta.
    Delta = 3,
    /// Ephemeral presence update.
    Awareness = 4,
    /// A peer disconnected from the room.
    PeerLeft = 5,
    /// Heartbeat ping.
    Ping = 6,
    /// Heartbeat pong.
    Pong = 7,
}

/// User identity attached to a connection at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
}

/// Room admission request: sent by the client as the first frame.
///
/// `state_vector` is `None` for a cold join and `Some` on reconnect, so the
/// relay can reply with only the missing operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub auth_token: String,
    pub display_name: String,
    pub state_vector: Option<StateVector>,
}

/// Reason a join was refused. Fatal to the connection attempt, never to
/// the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRefusal {
    AuthFailed,
    NotFound,
}

impl std::fmt::Display for JoinRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRefusal::AuthFailed => write!(f, "authentication failed"),
            JoinRefusal::NotFound => write!(f, "document not found"),
        }
    }
}

/// Admission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinResponse {
    Accepted {
        /// Deltas the joining replica has not seen yet (resync payload).
        missing_deltas: Vec<Delta>,
        /// The relay's own state vector at admission. The client checks its
        /// retained log against this and retransmits anything the relay
        /// lacks, closing gaps left by frames lost on a dead connection.
        state_vector: StateVector,
        /// Identities already present in the room.
        peers: Vec<(Uuid, UserIdentity)>,
    },
    Rejected {
        reason: JoinRefusal,
    },
}

/// Top-level protocol message. Serialized with bincode for minimal
/// envelope overhead; see module docs for the payload encodings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender's client id (the relay sends as `Uuid::nil()`).
    pub client_id: Uuid,
    pub doc_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Build a room admission request.
    pub fn join(client_id: Uuid, doc_id: Uuid, req: &JoinRequest) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(req).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Join,
            client_id,
            doc_id,
            payload,
        })
    }

    /// Build an admission response (relay → client).
    pub fn join_ack(doc_id: Uuid, resp: &JoinResponse) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(resp).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::JoinAck,
            client_id: Uuid::nil(),
            doc_id,
            payload,
        })
    }

    /// Build a document delta message.
    pub fn delta(client_id: Uuid, doc_id: Uuid, delta: &Delta) -> Result<Self, ProtocolError> {
        let payload = delta
            .encode()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Delta,
            client_id,
            doc_id,
            payload,
        })
    }

    /// Build an awareness update message.
    pub fn awareness(
        client_id: Uuid,
        doc_id: Uuid,
        msg: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = msg
            .encode()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Awareness,
            client_id,
            doc_id,
            payload,
        })
    }

    /// Build a peer-left notification.
    pub fn peer_left(client_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            client_id,
            doc_id,
            payload: Vec::new(),
        }
    }

    pub fn ping(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            client_id,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    pub fn pong(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            client_id,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a join-ack payload.
    pub fn join_response(&self) -> Result<JoinResponse, ProtocolError> {
        if self.msg_type != MessageType::JoinAck {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a delta payload.
    pub fn delta_payload(&self) -> Result<Delta, ProtocolError> {
        if self.msg_type != MessageType::Delta {
            return Err(ProtocolError::InvalidMessageType);
        }
        Delta::decode(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse an awareness payload.
    pub fn awareness_payload(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload).map_err(ProtocolError::Deserialization)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
    JoinRejected(JoinRefusal),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::JoinRejected(r) => write!(f, "Join rejected: {r}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
