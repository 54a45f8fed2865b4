use serde::{Deserialize, Serialize};

use crate::crypto::{AuthCredential, Ciphertext};
use crate::error::ProtocolError;
use crate::types::{PeerId, RoomCode, TaskId};

/// Envelopes exchanged over peer data channels.
///
/// Only `type`, chunk bookkeeping and the timestamp travel in clear;
/// task state is always inside a [`Ciphertext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// Full replacement of the sender's task list and class colors
    SyncUpdate {
        events: Ciphertext,
        #[serde(rename = "classColors")]
        class_colors: Ciphertext,
        /// Sender wall clock, Unix epoch millis
        timestamp: i64,
    },

    /// One fragment of a message that exceeded the chunk threshold
    Chunk { index: u32, total: u32, data: String },

    /// Liveness check
    Ping,

    /// Liveness reply
    Pong,
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, WireMessage::Ping | WireMessage::Pong)
    }
}

/// Connection-setup metadata relayed through the signaling store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub room: RoomCode,
    pub sender: PeerId,
    pub target: PeerId,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum SignalKind {
    /// Session description from the initiator
    Offer(String),
    /// Session description from the responder
    Answer(String),
    /// Network reachability candidate
    Candidate(String),
    /// Connection torn down by the sender
    Hangup,
}

/// A joiner adding itself to a room's peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer: PeerId,
    pub auth: AuthCredential,
    /// Fresh per announcement; repeats of the same nonce are redeliveries
    pub nonce: String,
}

impl PeerAnnouncement {
    pub fn new(peer: PeerId, auth: AuthCredential) -> Self {
        Self {
            peer,
            auth,
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay backend wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    /// Hex-encoded room salt
    pub salt: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub auth_hash: String,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// One task record as stored by the relay: encrypted individually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRecord {
    pub id: TaskId,
    pub payload: Ciphertext,
    /// Unix epoch millis of the last write
    pub updated_at: i64,
}

/// Change pushed to relay subscribers after another session writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayEvent {
    Saved { record: RelayRecord },
    Deleted { id: TaskId },
}

impl RelayEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
