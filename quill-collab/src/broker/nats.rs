//! NATS JetStream backend.
//!
//! Every relay connected to the same NATS server shares the category
//! stream, so rooms for one document converge across processes. Streams use
//! memory storage: the log is a transport, not a store of record.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_nats::HeaderMap;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;

use super::{
    AckHandle, ConsumerConfig, DistributedLog, LogError, LogMessage, PublishAck, PullConsumer,
    StreamConfig,
};

/// [`DistributedLog`] over a JetStream context.
#[derive(Clone)]
pub struct NatsLog {
    context: jetstream::Context,
}

impl NatsLog {
    /// Connect to `url` (e.g. `nats://127.0.0.1:4222`).
    pub async fn connect(url: &str) -> Result<Self, LogError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| LogError::Connect(format!("{url}: {e}")))?;
        log::info!("Connected to NATS at {url}");
        Ok(Self::new(client))
    }

    pub fn new(client: async_nats::Client) -> Self {
        Self {
            context: jetstream::new(client),
        }
    }
}

fn stream_definition(config: &StreamConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        max_age: config.max_age,
        duplicate_window: config.duplicate_window,
        max_messages: i64::try_from(config.max_messages).unwrap_or(i64::MAX),
        storage: stream::StorageType::Memory,
        ..Default::default()
    }
}

fn consumer_definition(filter_subject: String, config: ConsumerConfig) -> consumer::pull::Config {
    consumer::pull::Config {
        filter_subject,
        deliver_policy: consumer::DeliverPolicy::New,
        ack_policy: consumer::AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        ..Default::default()
    }
}

impl DistributedLog for NatsLog {
    fn ensure_stream(&self, config: StreamConfig) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            let definition = stream_definition(&config);
            self.context
                .get_or_create_stream(definition.clone())
                .await
                .map_err(|e| LogError::Stream(format!("{}: {e}", config.name)))?;
            // An existing stream keeps its old limits until updated.
            self.context
                .update_stream(definition)
                .await
                .map_err(|e| LogError::Stream(format!("{}: {e}", config.name)))?;
            Ok(())
        })
    }

    fn publish(
        &self,
        subject: String,
        payload: Vec<u8>,
        msg_id: Option<String>,
    ) -> BoxFuture<'_, Result<PublishAck, LogError>> {
        Box::pin(async move {
            let mut headers = HeaderMap::new();
            if let Some(id) = msg_id {
                headers.insert(async_nats::header::NATS_MESSAGE_ID, id.as_str());
            }
            let ack = self
                .context
                .publish_with_headers(subject, headers, payload.into())
                .await
                .map_err(|e| LogError::Publish(e.to_string()))?
                .await
                .map_err(|e| LogError::Publish(e.to_string()))?;
            Ok(PublishAck {
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            })
        })
    }

    fn pull_consumer(
        &self,
        stream: String,
        filter_subject: String,
        config: ConsumerConfig,
    ) -> BoxFuture<'_, Result<Box<dyn PullConsumer>, LogError>> {
        Box::pin(async move {
            let handle = self
                .context
                .get_stream(&stream)
                .await
                .map_err(|e| LogError::StreamNotFound(format!("{stream}: {e}")))?;
            let consumer: consumer::PullConsumer = handle
                .create_consumer(consumer_definition(filter_subject, config))
                .await
                .map_err(|e| LogError::Consumer(e.to_string()))?;
            Ok(Box::new(NatsConsumer { consumer }) as Box<dyn PullConsumer>)
        })
    }
}

struct NatsConsumer {
    consumer: consumer::PullConsumer,
}

impl PullConsumer for NatsConsumer {
    fn fetch(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<LogMessage>, LogError>> {
        Box::pin(async move {
            let mut batch = self
                .consumer
                .batch()
                .max_messages(max_messages.max(1))
                .expires(max_wait)
                .messages()
                .await
                .map_err(|e| LogError::Consumer(e.to_string()))?;

            let mut messages = Vec::new();
            while let Some(next) = batch.next().await {
                let message = next.map_err(|e| LogError::Consumer(e.to_string()))?;
                let (sequence, delivered) = match message.info() {
                    Ok(info) => (
                        info.stream_sequence,
                        u32::try_from(info.delivered).unwrap_or(u32::MAX),
                    ),
                    Err(e) => {
                        log::warn!("Skipping JetStream message without metadata: {e}");
                        continue;
                    }
                };
                messages.push(LogMessage::new(
                    message.subject.to_string(),
                    sequence,
                    message.payload.to_vec(),
                    delivered,
                    Arc::new(NatsAck { message }),
                ));
            }
            Ok(messages)
        })
    }
}

struct NatsAck {
    message: jetstream::Message,
}

impl AckHandle for NatsAck {
    fn ack(&self, _sequence: u64) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            self.message
                .ack()
                .await
                .map_err(|e| LogError::Consumer(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_definition_is_memory_backed() {
        let config = StreamConfig {
            max_messages: 500,
            ..StreamConfig::for_category("wiki")
        };
        let definition = stream_definition(&config);
        assert_eq!(definition.name, "wiki");
        assert_eq!(definition.subjects, vec!["wiki.*".to_string()]);
        assert_eq!(definition.max_age, Duration::from_secs(60));
        assert_eq!(definition.duplicate_window, Duration::from_secs(2));
        assert_eq!(definition.max_messages, 500);
        assert!(matches!(definition.storage, stream::StorageType::Memory));
    }

    #[test]
    fn test_oversized_message_limit_saturates() {
        let config = StreamConfig {
            max_messages: usize::MAX,
            ..StreamConfig::for_category("docs")
        };
        assert_eq!(stream_definition(&config).max_messages, i64::MAX);
    }

    #[test]
    fn test_consumer_delivers_new_with_explicit_ack() {
        let definition = consumer_definition(
            "docs.7".to_string(),
            ConsumerConfig {
                ack_wait: Duration::from_secs(3),
            },
        );
        assert_eq!(definition.filter_subject, "docs.7");
        assert!(matches!(definition.deliver_policy, consumer::DeliverPolicy::New));
        assert!(matches!(definition.ack_policy, consumer::AckPolicy::Explicit));
        assert_eq!(definition.ack_wait, Duration::from_secs(3));
        assert_eq!(definition.durable_name, None);
    }
}
