//! Binary frame protocol between editors and the relay.
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! client → server                 server → client
//! ┌───────────────────────┐       ┌───────────┬────────────────────────┐
//! │ ClientMessage         │       │ sender_id │ ServerMessage          │
//! │  Hello{document_id}   │       │ Option<u64>│  ClientIdAssigned{id} │
//! │  ContentUpdate{bytes} │       │           │  SyncStep{1|2, bytes}  │
//! │  AwarenessPing{bytes} │       │           │  ContentUpdate{bytes}  │
//! │  SyncStep1{sv}        │       │           │  AwarenessPing{bytes}  │
//! │  SyncStep2{to, bytes} │       │           │  TargetSaved{doc}      │
//! └───────────────────────┘       └───────────┴────────────────────────┘
//! ```
//!
//! Payloads are opaque to the relay: content updates belong to the editors'
//! CRDT, awareness payloads to `quill-awareness`.
//!
//! The same encoded [`ServerFrame`] is what gets published to the
//! distributed log, so a remote relay can forward it without re-encoding.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use quill_awareness::ClientId;

/// Numeric document identifier. Zero is reserved as "no document".
pub type DocumentId = u64;

/// Access level granted by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    pub fn can_write(self) -> bool {
        matches!(self, Role::Writer)
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reader" | "read" | "viewer" => Ok(Role::Reader),
            "writer" | "write" | "editor" => Ok(Role::Writer),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// Frames sent by editors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first frame on every connection.
    Hello { target_document_id: DocumentId },
    /// Incremental CRDT update
    ContentUpdate { update: Vec<u8> },
    /// Encoded awareness update
    AwarenessPing { update: Vec<u8> },
    /// State vector announcement for the two-phase sync
    SyncStep1 { state_vector: Vec<u8> },
    /// Catch-up payload answering another client's step 1
    SyncStep2 { to: ClientId, update: Vec<u8> },
}

impl ClientMessage {
    pub fn hello(target_document_id: DocumentId) -> Self {
        Self::Hello { target_document_id }
    }

    pub fn content(update: Vec<u8>) -> Self {
        Self::ContentUpdate { update }
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Self::AwarenessPing { update }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Which half of the two-phase sync a [`ServerMessage::SyncStep`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncStep {
    /// State vector: "here is what I have"
    One = 1,
    /// Missing updates for a specific peer
    Two = 2,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    ClientIdAssigned { client_id: ClientId },
    SyncStep { step: SyncStep, payload: Vec<u8> },
    ContentUpdate { update: Vec<u8> },
    AwarenessPing { update: Vec<u8> },
    TargetSaved { document_id: DocumentId },
}

impl ServerMessage {
    /// Update or presence frames with nothing in them; broadcasting these is
    /// a no-op.
    pub fn is_empty_payload(&self) -> bool {
        match self {
            ServerMessage::ContentUpdate { update } | ServerMessage::AwarenessPing { update } => {
                update.is_empty()
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ClientIdAssigned { .. } => "client_id_assigned",
            ServerMessage::SyncStep { .. } => "sync_step",
            ServerMessage::ContentUpdate { .. } => "content_update",
            ServerMessage::AwarenessPing { .. } => "awareness_ping",
            ServerMessage::TargetSaved { .. } => "target_saved",
        }
    }
}

/// A server message tagged with the client it originated from.
///
/// `sender_id` is `None` for frames the relay itself produces (client id
/// assignment, save notifications), so editors can tell their own echoes
/// apart from everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub sender_id: Option<ClientId>,
    pub message: ServerMessage,
}

impl ServerFrame {
    pub fn from_client(sender_id: ClientId, message: ServerMessage) -> Self {
        Self {
            sender_id: Some(sender_id),
            message,
        }
    }

    pub fn from_server(message: ServerMessage) -> Self {
        Self {
            sender_id: None,
            message,
        }
    }

    pub fn client_id_assigned(client_id: ClientId) -> Self {
        Self::from_server(ServerMessage::ClientIdAssigned { client_id })
    }

    pub fn target_saved(document_id: DocumentId) -> Self {
        Self::from_server(ServerMessage::TargetSaved { document_id })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("Unknown role: {0}")]
    UnknownRole(String),
}
