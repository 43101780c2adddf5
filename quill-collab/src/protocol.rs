//! Binary protocol for document synchronization.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id       │ payload  │
//! │ varint   │ 16 bytes  │ len + UTF-8  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! Handshake: the first client frame must be `Auth`, naming the document and
//! (optionally) carrying the credential. The server answers `Authenticated`
//! followed by the full document state as `SyncStep2`, or `AuthRejected`
//! followed by a close frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted document id, in bytes.
pub const MAX_DOC_ID_LEN: usize = 256;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake: document id + credential (client → server)
    Auth = 1,
    /// Handshake accepted, payload is a [`Welcome`]
    Authenticated = 2,
    /// Handshake refused, payload is a UTF-8 reason
    AuthRejected = 3,
    /// Encoded state vector, answered with a diff
    SyncStep1 = 4,
    /// Encoded diff or full state
    SyncStep2 = 5,
    /// One update fragment
    Update = 6,
    /// Peer joined notification, payload is a [`PeerInfo`]
    PeerJoined = 7,
    /// Peer left notification
    PeerLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Peer identity as shown to other peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Payload of `Authenticated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    /// The server-assigned identity of this connection.
    pub peer: PeerInfo,
    /// The document failed to load and started empty.
    pub degraded: bool,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.into(),
            payload,
        }
    }

    /// Handshake frame. An empty credential defers to the `token` query parameter.
    pub fn auth(doc_id: impl Into<String>, credential: &str) -> Self {
        Self::new(MessageType::Auth, Uuid::nil(), doc_id, credential.as_bytes().to_vec())
    }

    pub fn authenticated(doc_id: impl Into<String>, welcome: &Welcome) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(welcome, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Authenticated, welcome.peer.peer_id, doc_id, payload))
    }

    pub fn auth_rejected(doc_id: impl Into<String>, reason: &str) -> Self {
        Self::new(MessageType::AuthRejected, Uuid::nil(), doc_id, reason.as_bytes().to_vec())
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, doc_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(doc_id: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, Uuid::nil(), doc_id, state_diff)
    }

    /// Create an update message carrying one fragment.
    pub fn update(peer_id: Uuid, doc_id: impl Into<String>, fragment: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, doc_id, fragment)
    }

    pub fn peer_joined(doc_id: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, doc_id, payload))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: impl Into<String>) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), Vec::new())
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

    /// Parse the `Authenticated` payload.
    pub fn welcome(&self) -> Result<Welcome, ProtocolError> {
        self.expect(MessageType::Authenticated)?;
        let (welcome, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(welcome)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }

    /// Payload as text (credential or rejection reason).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        Ok(())
    }
}

/// Check a document id taken from a handshake.
pub fn validate_doc_id(doc_id: &str) -> Result<(), ProtocolError> {
    if doc_id.trim().is_empty() {
        return Err(ProtocolError::EmptyDocumentId);
    }
    if doc_id.len() > MAX_DOC_ID_LEN {
        return Err(ProtocolError::DocumentIdTooLong(doc_id.len()));
    }
    Ok(())
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Expected {expected:?} message, got {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("Handshake must start with Auth, got {0:?}")]
    UnexpectedFirstFrame(MessageType),
    #[error("Non-binary frame during handshake")]
    NonBinaryFrame,
    #[error("Document id is empty")]
    EmptyDocumentId,
    #[error("Document id is {0} bytes, limit is {MAX_DOC_ID_LEN}")]
    DocumentIdTooLong(usize),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
