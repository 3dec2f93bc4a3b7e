//! Distributed log seam used to replicate room broadcasts across relay
//! processes.
//!
//! Architecture:
//! ```text
//! relay A                      log stream "docs"               relay B
//! Room(doc 7) ── publish ──►  subject docs.7  ── fetch/ack ──► Room(doc 7)
//!                             subject docs.9                   (pull consumer)
//! ```
//!
//! Delivery is at-least-once: consumers ack every message and unacked
//! messages come back after the consumer's ack wait. The stream keeps
//! messages in memory for a short age and suppresses publishes that repeat a
//! message id inside the duplicate window. It is a transport, not a store of
//! record.
//!
//! [`NatsLog`] stores the stream in a NATS JetStream server shared by every
//! relay process. [`MemoryLog`] implements the seam in-process; several
//! relays sharing one `MemoryLog` behave like separate processes sharing a
//! broker.

pub mod memory;
pub mod nats;

pub use memory::MemoryLog;
pub use nats::NatsLog;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

/// Stream definition, applied idempotently by [`DistributedLog::ensure_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Subject patterns captured by the stream. `*` matches one token,
    /// `>` matches the rest.
    pub subjects: Vec<String>,
    pub max_age: Duration,
    pub duplicate_window: Duration,
    pub max_messages: usize,
}

impl StreamConfig {
    /// One stream per category capturing `<category>.*`.
    pub fn for_category(category: &str) -> Self {
        Self {
            name: category.to_string(),
            subjects: vec![format!("{category}.*")],
            ..Self::default()
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            max_age: Duration::from_secs(60),
            duplicate_window: Duration::from_secs(2),
            max_messages: 10_000,
        }
    }
}

/// Pull consumer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// How long a fetched message may stay unacked before redelivery.
    pub ack_wait: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(5),
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
    /// The message id was seen inside the duplicate window; nothing stored.
    pub duplicate: bool,
}

/// Acknowledgement path back to the consumer that delivered a message.
pub trait AckHandle: Send + Sync {
    fn ack(&self, sequence: u64) -> BoxFuture<'_, Result<(), LogError>>;
}

/// A message handed out by [`PullConsumer::fetch`].
pub struct LogMessage {
    pub subject: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivered: u32,
    acker: Arc<dyn AckHandle>,
}

impl LogMessage {
    pub fn new(
        subject: String,
        sequence: u64,
        payload: Vec<u8>,
        delivered: u32,
        acker: Arc<dyn AckHandle>,
    ) -> Self {
        Self {
            subject,
            sequence,
            payload,
            delivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), LogError> {
        self.acker.ack(self.sequence).await
    }
}

impl std::fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// Pull-based consumer bound to one filter subject.
pub trait PullConsumer: Send {
    /// Wait up to `max_wait` for at most `max_messages`. An empty batch
    /// means the wait expired with nothing to deliver.
    fn fetch(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<LogMessage>, LogError>>;
}

/// Durable subject-addressed publish/subscribe transport.
pub trait DistributedLog: Send + Sync + 'static {
    /// Create the stream or update it in place.
    fn ensure_stream(&self, config: StreamConfig) -> BoxFuture<'_, Result<(), LogError>>;

    fn publish(
        &self,
        subject: String,
        payload: Vec<u8>,
        msg_id: Option<String>,
    ) -> BoxFuture<'_, Result<PublishAck, LogError>>;

    /// Deliver-new pull consumer: only messages published after creation.
    fn pull_consumer(
        &self,
        stream: String,
        filter_subject: String,
        config: ConsumerConfig,
    ) -> BoxFuture<'_, Result<Box<dyn PullConsumer>, LogError>>;
}

/// Distributed log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("cannot reach log backend: {0}")]
    Connect(String),
    #[error("stream setup failed: {0}")]
    Stream(String),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("no stream captures subject {0}")]
    NoStreamForSubject(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consumer failed: {0}")]
    Consumer(String),
    #[error("log backend closed")]
    Closed,
}

/// Subject `<category>.<document_id>`.
pub fn room_subject(category: &str, document_id: u64) -> String {
    format!("{category}.{document_id}")
}

/// Token-wise subject match supporting `*` and a trailing `>`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("docs.*", "docs.42"));
        assert!(subject_matches("docs.42", "docs.42"));
        assert!(subject_matches("docs.>", "docs.42.extra"));
        assert!(!subject_matches("docs.*", "docs.42.extra"));
        assert!(!subject_matches("docs.*", "wiki.42"));
        assert!(!subject_matches("docs.*", "docs"));
        assert!(!subject_matches("docs.>", "docs"));
    }

    #[test]
    fn test_room_subject() {
        assert_eq!(room_subject("docs", 42), "docs.42");
    }

    #[test]
    fn test_stream_config_for_category() {
        let config = StreamConfig::for_category("wiki");
        assert_eq!(config.name, "wiki");
        assert_eq!(config.subjects, vec!["wiki.*".to_string()]);
        assert_eq!(config.duplicate_window, Duration::from_secs(2));
    }
}
