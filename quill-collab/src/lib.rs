//! # quill-collab — Real-time collaboration relay for Quill
//!
//! Routes CRDT updates and presence pings between editors of the same
//! document, across any number of relay processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket   ┌──────────────────────────┐
//! │ Editor A │ ◄──────────► │ CollabServer (relay 1)   │
//! └──────────┘              │   Room(doc) ─ send loops │
//! ┌──────────┐              └────────────┬─────────────┘
//! │ Editor B │ ◄──────┐         publish  │  ▲ fan-in
//! └──────────┘        │                  ▼  │
//!                     │          ┌────────────────┐
//!                     │          │ DistributedLog │
//!                     │          │ <category>.<doc>│
//!                     │          └────────────────┘
//!                     │                  ▲  │
//!                     │         publish  │  ▼ fan-in
//!                     │     ┌──────────────────────────┐
//!                     └───► │ CollabServer (relay 2)   │
//!                           └──────────────────────────┘
//! ```
//!
//! The relay never interprets document content. It only reads presence
//! updates far enough to announce departed clients as offline.
//!
//! ## Modules
//!
//! - [`protocol`] — Client/server frames (bincode-encoded)
//! - [`client`] — Per-connection handle, identity, bounded send loop
//! - [`room`] — Per-document fan-out and log fan-in
//! - [`server`] — Room registry, handshake, WebSocket transport
//! - [`broker`] — Distributed log seam, NATS JetStream and in-memory backends
//! - [`metrics`] — Occupancy gauges and traffic counters
//! - [`config`] — Relay configuration

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broker::{
    ConsumerConfig, DistributedLog, LogError, LogMessage, MemoryLog, NatsLog, PublishAck,
    PullConsumer, StreamConfig,
};
pub use client::{
    derive_client_id, ClientConnection, ClientIdentity, OutboundFrame, OutboundQueue,
    DEFAULT_QUEUE_CAPACITY, MAX_CLIENT_ID,
};
pub use config::ServerConfig;
pub use error::CollabError;
pub use metrics::{CollabMetrics, ServerStats};
pub use protocol::{
    ClientId, ClientMessage, DocumentId, ProtocolError, Role, ServerFrame, ServerMessage,
    SyncStep,
};
pub use room::{Departure, Room};
pub use server::{handle_first_msg, CollabServer};
