use thiserror::Error;

use quill_awareness::DecodeError;

use crate::broker::LogError;
use crate::protocol::{ClientId, ProtocolError};

/// Errors surfaced by the relay.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Client {0} already joined this room")]
    DuplicateClient(ClientId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Awareness decode error: {0}")]
    Awareness(#[from] DecodeError),
    #[error("Distributed log error: {0}")]
    Log(#[from] LogError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
}
