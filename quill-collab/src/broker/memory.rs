//! In-process [`DistributedLog`] backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    subject_matches, AckHandle, ConsumerConfig, DistributedLog, LogError, LogMessage,
    PublishAck, PullConsumer, StreamConfig,
};

struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
    published_at: Instant,
}

struct StreamState {
    config: StreamConfig,
    messages: VecDeque<StoredMessage>,
    last_sequence: u64,
    /// msg-id → (sequence, first seen)
    recent_ids: HashMap<String, (u64, Instant)>,
    notify: Arc<Notify>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: VecDeque::new(),
            last_sequence: 0,
            recent_ids: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn enforce_retention(&mut self, now: Instant) {
        let max_age = self.config.max_age;
        while let Some(front) = self.messages.front() {
            if now.duration_since(front.published_at) > max_age {
                self.messages.pop_front();
            } else {
                break;
            }
        }
        while self.messages.len() > self.config.max_messages {
            self.messages.pop_front();
        }
        let window = self.config.duplicate_window;
        self.recent_ids
            .retain(|_, (_, seen)| now.duration_since(*seen) <= window);
    }

    fn get(&self, sequence: u64) -> Option<&StoredMessage> {
        let first = self.messages.front()?.sequence;
        let idx = sequence.checked_sub(first)? as usize;
        self.messages.get(idx).filter(|m| m.sequence == sequence)
    }
}

#[derive(Default)]
struct LogState {
    streams: HashMap<String, StreamState>,
}

/// In-memory stream store with deliver-new pull consumers.
///
/// Cloning shares the underlying streams.
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a stream. Consumers bound to it fail on their next fetch.
    pub fn delete_stream(&self, name: &str) -> bool {
        let removed = self.lock().streams.remove(name);
        match removed {
            Some(stream) => {
                stream.notify.notify_waiters();
                log::info!("Deleted stream {}", name);
                true
            }
            None => false,
        }
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.lock().streams.contains_key(name)
    }

    /// Messages currently retained by a stream.
    pub fn message_count(&self, name: &str) -> usize {
        let mut state = self.lock();
        match state.streams.get_mut(name) {
            Some(stream) => {
                stream.enforce_retention(Instant::now());
                stream.messages.len()
            }
            None => 0,
        }
    }
}

impl DistributedLog for MemoryLog {
    fn ensure_stream(&self, config: StreamConfig) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            let mut state = self.lock();
            match state.streams.get_mut(&config.name) {
                Some(existing) => {
                    log::debug!("Updating stream {}", config.name);
                    existing.config = config;
                    existing.enforce_retention(Instant::now());
                }
                None => {
                    log::info!(
                        "Created stream {} for subjects {:?}",
                        config.name,
                        config.subjects
                    );
                    state
                        .streams
                        .insert(config.name.clone(), StreamState::new(config));
                }
            }
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
            let now = Instant::now();
            let mut state = self.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.config.subjects.iter().any(|p| subject_matches(p, &subject)))
                .ok_or_else(|| LogError::NoStreamForSubject(subject.clone()))?;

            stream.enforce_retention(now);

            if let Some(id) = &msg_id {
                if let Some((sequence, _)) = stream.recent_ids.get(id) {
                    log::trace!("Duplicate publish {} on {}", id, subject);
                    return Ok(PublishAck {
                        sequence: *sequence,
                        duplicate: true,
                    });
                }
            }

            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            if let Some(id) = msg_id {
                stream.recent_ids.insert(id, (sequence, now));
            }
            stream.messages.push_back(StoredMessage {
                sequence,
                subject,
                payload,
                published_at: now,
            });
            stream.enforce_retention(now);
            stream.notify.notify_waiters();

            Ok(PublishAck {
                sequence,
                duplicate: false,
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
            let next_sequence = {
                let state = self.lock();
                let s = state
                    .streams
                    .get(&stream)
                    .ok_or_else(|| LogError::StreamNotFound(stream.clone()))?;
                s.last_sequence + 1
            };
            log::debug!(
                "Pull consumer on {} filter {} starting at seq {}",
                stream,
                filter_subject,
                next_sequence
            );
            let consumer: Box<dyn PullConsumer> = Box::new(MemoryConsumer {
                log: self.clone(),
                stream,
                filter_subject,
                config,
                cursor: Arc::new(Mutex::new(ConsumerCursor {
                    next_sequence,
                    pending: HashMap::new(),
                })),
            });
            Ok(consumer)
        })
    }
}

struct Pending {
    delivered_at: Instant,
    delivered: u32,
}

struct ConsumerCursor {
    next_sequence: u64,
    pending: HashMap<u64, Pending>,
}

struct CursorAck {
    cursor: Arc<Mutex<ConsumerCursor>>,
}

impl AckHandle for CursorAck {
    fn ack(&self, sequence: u64) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            self.cursor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .remove(&sequence);
            Ok(())
        })
    }
}

struct MemoryConsumer {
    log: MemoryLog,
    stream: String,
    filter_subject: String,
    config: ConsumerConfig,
    cursor: Arc<Mutex<ConsumerCursor>>,
}

enum Fetched {
    Ready(Vec<LogMessage>),
    /// Nothing deliverable; the earliest pending redelivery, if any.
    Idle(Arc<Notify>, Option<Instant>),
}

impl MemoryConsumer {
    fn poll_batch(&self, max_messages: usize, now: Instant) -> Result<Fetched, LogError> {
        let mut state = self.log.lock();
        let stream = state
            .streams
            .get_mut(&self.stream)
            .ok_or_else(|| LogError::StreamNotFound(self.stream.clone()))?;
        stream.enforce_retention(now);

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let acker: Arc<dyn AckHandle> = Arc::new(CursorAck {
            cursor: Arc::clone(&self.cursor),
        });
        let ack_wait = self.config.ack_wait;
        let mut batch = Vec::new();

        // Expired messages can no longer be redelivered.
        cursor
            .pending
            .retain(|seq, _| stream.get(*seq).is_some());

        let mut due: Vec<u64> = cursor
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= ack_wait)
            .map(|(seq, _)| *seq)
            .collect();
        due.sort_unstable();
        for seq in due.into_iter().take(max_messages) {
            if let (Some(msg), Some(pending)) = (stream.get(seq), cursor.pending.get_mut(&seq)) {
                pending.delivered += 1;
                pending.delivered_at = now;
                batch.push(LogMessage::new(
                    msg.subject.clone(),
                    msg.sequence,
                    msg.payload.clone(),
                    pending.delivered,
                    Arc::clone(&acker),
                ));
            }
        }

        let next = cursor.next_sequence;
        let mut advanced_to = next;
        for msg in stream.messages.iter().filter(|m| m.sequence >= next) {
            if batch.len() >= max_messages {
                break;
            }
            advanced_to = msg.sequence + 1;
            if !subject_matches(&self.filter_subject, &msg.subject) {
                continue;
            }
            cursor.pending.insert(
                msg.sequence,
                Pending {
                    delivered_at: now,
                    delivered: 1,
                },
            );
            batch.push(LogMessage::new(
                msg.subject.clone(),
                msg.sequence,
                msg.payload.clone(),
                1,
                Arc::clone(&acker),
            ));
        }
        if batch.len() < max_messages {
            advanced_to = advanced_to.max(stream.last_sequence + 1);
        }
        cursor.next_sequence = advanced_to;

        if !batch.is_empty() {
            return Ok(Fetched::Ready(batch));
        }
        let next_redelivery = cursor
            .pending
            .values()
            .map(|p| p.delivered_at + ack_wait)
            .min();
        Ok(Fetched::Idle(Arc::clone(&stream.notify), next_redelivery))
    }
}

impl PullConsumer for MemoryConsumer {
    fn fetch(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<LogMessage>, LogError>> {
        Box::pin(async move {
            let deadline = Instant::now() + max_wait;
            loop {
                let now = Instant::now();
                let (notify, next_redelivery) = match self.poll_batch(max_messages.max(1), now)? {
                    Fetched::Ready(batch) => return Ok(batch),
                    Fetched::Idle(notify, next_redelivery) => (notify, next_redelivery),
                };
                if now >= deadline {
                    return Ok(Vec::new());
                }

                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                // A publish may have landed between the poll and enable().
                if let Fetched::Ready(batch) =
                    self.poll_batch(max_messages.max(1), Instant::now())?
                {
                    return Ok(batch);
                }

                let wake_at = next_redelivery.map_or(deadline, |t| t.min(deadline));
                let _ = tokio::time::timeout_at(wake_at, notified).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs_stream() -> StreamConfig {
        StreamConfig::for_category("docs")
    }

    async fn log_with_stream() -> MemoryLog {
        let log = MemoryLog::new();
        log.ensure_stream(docs_stream()).await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_publish_requires_stream() {
        let log = MemoryLog::new();
        let err = log
            .publish("docs.1".into(), vec![1], None)
            .await
            .unwrap_err();
        assert_eq!(err, LogError::NoStreamForSubject("docs.1".into()));
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let log = log_with_stream().await;
        log.publish("docs.1".into(), vec![1], None).await.unwrap();
        log.ensure_stream(docs_stream()).await.unwrap();
        assert_eq!(log.message_count("docs"), 1);
    }

    #[tokio::test]
    async fn test_consumer_is_deliver_new() {
        let log = log_with_stream().await;
        log.publish("docs.1".into(), vec![1], None).await.unwrap();

        let mut consumer = log
            .pull_consumer("docs".into(), "docs.1".into(), ConsumerConfig::default())
            .await
            .unwrap();
        log.publish("docs.1".into(), vec![2], None).await.unwrap();

        let batch = consumer.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, vec![2]);
        assert_eq!(batch[0].delivered, 1);
    }

    #[tokio::test]
    async fn test_consumer_filters_by_subject() {
        let log = log_with_stream().await;
        let mut consumer = log
            .pull_consumer("docs".into(), "docs.7".into(), ConsumerConfig::default())
            .await
            .unwrap();
        log.publish("docs.8".into(), vec![8], None).await.unwrap();
        log.publish("docs.7".into(), vec![7], None).await.unwrap();

        let batch = consumer.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "docs.7");
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let log = log_with_stream().await;
        let mut consumer = log
            .pull_consumer("docs".into(), "docs.1".into(), ConsumerConfig::default())
            .await
            .unwrap();
        let batch = consumer.fetch(10, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let log = log_with_stream().await;
        let mut consumer = log
            .pull_consumer("docs".into(), "docs.1".into(), ConsumerConfig::default())
            .await
            .unwrap();

        let publisher = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("docs.1".into(), vec![5], None)
                .await
                .unwrap();
        });

        let batch = consumer.fetch(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, vec![5]);
    }

    #[tokio::test]
    async fn test_duplicate_msg_id_suppressed() {
        let log = log_with_stream().await;
        let first = log
            .publish("docs.1".into(), vec![1], Some("a".into()))
            .await
            .unwrap();
        let second = log
            .publish("docs.1".into(), vec![1], Some("a".into()))
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(log.message_count("docs"), 1);
    }

    #[tokio::test]
    async fn test_max_messages_retention() {
        let log = MemoryLog::new();
        log.ensure_stream(StreamConfig {
            max_messages: 3,
            ..docs_stream()
        })
        .await
        .unwrap();
        for i in 0..5u8 {
            log.publish("docs.1".into(), vec![i], None).await.unwrap();
        }
        assert_eq!(log.message_count("docs"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_retention() {
        let log = MemoryLog::new();
        log.ensure_stream(StreamConfig {
            max_age: Duration::from_secs(1),
            ..docs_stream()
        })
        .await
        .unwrap();
        log.publish("docs.1".into(), vec![1], None).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(log.message_count("docs"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_redelivered() {
        let log = log_with_stream().await;
        let mut consumer = log
            .pull_consumer(
                "docs".into(),
                "docs.1".into(),
                ConsumerConfig {
                    ack_wait: Duration::from_millis(100),
                },
            )
            .await
            .unwrap();
        log.publish("docs.1".into(), vec![1], None).await.unwrap();

        let first = consumer.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        let again = consumer.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].sequence, first[0].sequence);
        assert_eq!(again[0].delivered, 2);

        again[0].ack().await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        let none = consumer.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_stream_fails_consumer() {
        let log = log_with_stream().await;
        let mut consumer = log
            .pull_consumer("docs".into(), "docs.1".into(), ConsumerConfig::default())
            .await
            .unwrap();
        assert!(log.delete_stream("docs"));
        let err = consumer
            .fetch(10, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, LogError::StreamNotFound("docs".into()));
    }

    #[tokio::test]
    async fn test_consumer_on_missing_stream() {
        let log = MemoryLog::new();
        let result = log
            .pull_consumer("docs".into(), "docs.1".into(), ConsumerConfig::default())
            .await;
        assert!(matches!(result, Err(LogError::StreamNotFound(_))));
    }
}
