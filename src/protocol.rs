//! Binary protocol for delta synchronization.
//!
//! Every frame is a bincode-encoded `SyncMessage`:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ replica   │ doc_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The handshake is a two-step exchange: `SyncStep1` carries the sender's
//! state vector, `SyncStep2` answers with exactly the operations the
//! sender is missing. After the handshake both sides stream incremental
//! `Update` frames (durable: document + comment operations) and
//! `Awareness` frames (ephemeral, never stored or replayed).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comments::CommentOp;
use crate::crdt::{Operation, ReplicaId, StateVector};
use crate::presence::{stable_color, AwarenessUpdate};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector for the sync handshake
    SyncStep1 = 1,
    /// Missing-operations response
    SyncStep2 = 2,
    /// Incremental durable update (document + comment ops)
    Update = 3,
    /// Ephemeral cursor/selection awareness
    Awareness = 4,
    /// Participant joined with identity metadata
    Join = 5,
    /// Participant left
    Leave = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Unrecoverable rejection; the connection closes after this
    Fatal = 9,
}

/// Permission level of a participant, granted by the relay at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Editor,
    Commenter,
    Viewer,
}

impl Role {
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn can_comment(&self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub replica: ReplicaId,
    pub user_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering, stable per user.
    pub color: [f32; 4],
    pub role: Role,
}

impl ClientState {
    pub fn new(user_id: Uuid, name: impl Into<String>, role: Role) -> Self {
        Self {
            replica: Uuid::new_v4(),
            user_id,
            name: name.into(),
            color: stable_color(user_id),
            role,
        }
    }

    /// Create with explicit replica id (for testing).
    pub fn with_replica(replica: ReplicaId, user_id: Uuid, name: impl Into<String>, role: Role) -> Self {
        Self {
            replica,
            user_id,
            name: name.into(),
            color: stable_color(user_id),
            role,
        }
    }
}

/// The durable changes carried by `Update` and `SyncStep2` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub ops: Vec<Operation>,
    pub comments: Vec<CommentOp>,
}

impl UpdatePayload {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.comments.is_empty()
    }
}

/// Why the relay refused to keep talking to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalReason {
    /// Credential rejected.
    Unauthorized,
    /// The requested document does not exist.
    DocumentNotFound,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalReason::Unauthorized => write!(f, "unauthorized"),
            FatalReason::DocumentNotFound => write!(f, "document not found"),
        }
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub replica: ReplicaId,
    pub doc_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a sync step 1 (state vector announcement).
    pub fn sync_step1(
        replica: ReplicaId,
        doc_id: Uuid,
        state: &StateVector,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep1,
            replica,
            doc_id,
            payload: encode_payload(state)?,
        })
    }

    /// Create a sync step 2 (missing-operations response).
    pub fn sync_step2(
        replica: ReplicaId,
        doc_id: Uuid,
        payload: &UpdatePayload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            replica,
            doc_id,
            payload: encode_payload(payload)?,
        })
    }

    /// Create an incremental durable update.
    pub fn update(
        replica: ReplicaId,
        doc_id: Uuid,
        payload: &UpdatePayload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Update,
            replica,
            doc_id,
            payload: encode_payload(payload)?,
        })
    }

    /// Create an ephemeral awareness frame.
    pub fn awareness(
        replica: ReplicaId,
        doc_id: Uuid,
        update: &AwarenessUpdate,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Awareness,
            replica,
            doc_id,
            payload: update
                .encode()
                .map_err(ProtocolError::SerializationError)?,
        })
    }

    /// Create a join announcement with identity metadata.
    pub fn join(doc_id: Uuid, state: &ClientState) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Join,
            replica: state.replica,
            doc_id,
            payload: encode_payload(state)?,
        })
    }

    /// Create a leave notification.
    pub fn leave(replica: ReplicaId, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Leave,
            replica,
            doc_id,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(replica: ReplicaId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            replica,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(replica: ReplicaId) -> Self {
        Self {
            msg_type: MessageType::Pong,
            replica,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Create a fatal rejection. The sender closes after this frame.
    pub fn fatal(doc_id: Uuid, reason: FatalReason) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Fatal,
            replica: Uuid::nil(),
            doc_id,
            payload: encode_payload(&reason)?,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a `SyncStep1` payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.msg_type != MessageType::SyncStep1 {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse a `SyncStep2` or `Update` payload.
    pub fn update_payload(&self) -> Result<UpdatePayload, ProtocolError> {
        if !matches!(self.msg_type, MessageType::SyncStep2 | MessageType::Update) {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse an `Awareness` payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessUpdate::decode(&self.payload).map_err(ProtocolError::DeserializationError)
    }

    /// Parse a `Join` payload.
    pub fn client_state(&self) -> Result<ClientState, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse a `Fatal` payload.
    pub fn fatal_reason(&self) -> Result<FatalReason, ProtocolError> {
        if self.msg_type != MessageType::Fatal {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
