use std::str::FromStr;
use std::time::Duration;

use crate::broker::{ConsumerConfig, StreamConfig};
use crate::client::DEFAULT_QUEUE_CAPACITY;

/// Lower bound for the fan-in pull wait.
pub const MIN_FETCH_WAIT: Duration = Duration::from_millis(10);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Deployment namespace; names the log stream and prefixes subjects
    pub category: String,
    /// NATS server holding the shared log. `None` keeps replication inside
    /// this process.
    pub log_url: Option<String>,
    /// Outbound frames buffered per client before drops start
    pub client_queue_capacity: usize,
    /// Max messages per fan-in pull
    pub fetch_batch: usize,
    /// How long one fan-in pull waits for messages
    pub fetch_max_wait: Duration,
    pub ack_wait: Duration,
    pub stream_max_age: Duration,
    pub stream_duplicate_window: Duration,
    pub stream_max_messages: usize,
    /// Re-create the room consumer after a hard fan-in error instead of
    /// leaving the room local-only.
    pub resubscribe_on_error: bool,
    pub resubscribe_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            category: "docs".to_string(),
            log_url: None,
            client_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fetch_batch: 64,
            fetch_max_wait: Duration::from_secs(1),
            ack_wait: ConsumerConfig::default().ack_wait,
            stream_max_age: stream.max_age,
            stream_duplicate_window: stream.duplicate_window,
            stream_max_messages: stream.max_messages,
            resubscribe_on_error: false,
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `QUILL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(category) = lookup("QUILL_CATEGORY").filter(|c| !c.is_empty()) {
            config.category = category;
        }
        if let Some(url) = lookup("QUILL_LOG_URL").filter(|u| !u.is_empty()) {
            config.log_url = Some(url);
        }
        if let Some(capacity) = parse_var(&lookup, "QUILL_QUEUE_CAPACITY") {
            config.client_queue_capacity = capacity;
        }
        if let Some(batch) = parse_var(&lookup, "QUILL_FETCH_BATCH") {
            config.fetch_batch = batch;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "QUILL_FETCH_WAIT_MS") {
            let wait = Duration::from_millis(ms);
            if wait < MIN_FETCH_WAIT {
                log::warn!(
                    "QUILL_FETCH_WAIT_MS={} is below the {:?} minimum, using the minimum",
                    ms,
                    MIN_FETCH_WAIT
                );
            }
            config.fetch_max_wait = wait.max(MIN_FETCH_WAIT);
        }
        if let Some(resubscribe) = parse_var(&lookup, "QUILL_RESUBSCRIBE") {
            config.resubscribe_on_error = resubscribe;
        }
        config
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            max_age: self.stream_max_age,
            duplicate_window: self.stream_duplicate_window,
            max_messages: self.stream_max_messages,
            ..StreamConfig::for_category(&self.category)
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            ack_wait: self.ack_wait,
        }
    }

    pub(crate) fn fan_in(&self) -> FanInSettings {
        FanInSettings {
            stream: self.category.clone(),
            consumer: self.consumer_config(),
            batch: self.fetch_batch.max(1),
            max_wait: self.fetch_max_wait.max(MIN_FETCH_WAIT),
            resubscribe: self.resubscribe_on_error.then_some(self.resubscribe_backoff),
        }
    }
}

/// What a room's fan-in task needs from the relay configuration.
#[derive(Debug, Clone)]
pub(crate) struct FanInSettings {
    pub stream: String,
    pub consumer: ConsumerConfig,
    pub batch: usize,
    pub max_wait: Duration,
    /// Backoff before re-subscribing, or `None` to stop on the first error
    pub resubscribe: Option<Duration>,
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable {}={:?}, using default", key, raw);
            None
        }
    }
}
