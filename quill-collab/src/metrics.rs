//! Relay occupancy and traffic counters.
//!
//! Counters live in atomics so the fan-out path never takes a lock to record
//! them. Gauge changes are mirrored to the `metrics` facade, labeled by
//! category, for whatever recorder the embedding process installs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`CollabMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub active_rooms: u64,
    pub connected_clients: u64,
    pub total_connections: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_dropped: u64,
    pub remote_messages: u64,
}

pub struct CollabMetrics {
    category: String,
    active_rooms: AtomicU64,
    connected_clients: AtomicU64,
    total_connections: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_dropped: AtomicU64,
    remote_messages: AtomicU64,
}

impl CollabMetrics {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            active_rooms: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            remote_messages: AtomicU64::new(0),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn room_created(&self) {
        let now = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("quill_collab_active_rooms", "category" => self.category.clone())
            .set(now as f64);
    }

    pub fn room_removed(&self) {
        let now = decrement(&self.active_rooms);
        metrics::gauge!("quill_collab_active_rooms", "category" => self.category.clone())
            .set(now as f64);
    }

    pub fn client_joined(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let now = self.connected_clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("quill_collab_connected_clients", "category" => self.category.clone())
            .set(now as f64);
    }

    pub fn client_left(&self) {
        let now = decrement(&self.connected_clients);
        metrics::gauge!("quill_collab_connected_clients", "category" => self.category.clone())
            .set(now as f64);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "quill_collab_publish_failures_total",
            "category" => self.category.clone()
        )
        .increment(1);
    }

    pub fn messages_dropped(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "quill_collab_dropped_messages_total",
            "category" => self.category.clone()
        )
        .increment(count);
    }

    pub fn remote_message(&self) {
        self.remote_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_rooms(&self) -> u64 {
        self.active_rooms.load(Ordering::Relaxed)
    }

    pub fn connected_clients(&self) -> u64 {
        self.connected_clients.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            remote_messages: self.remote_messages.load(Ordering::Relaxed),
        }
    }
}

/// Saturating decrement; returns the new value.
fn decrement(counter: &AtomicU64) -> u64 {
    let prev = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
        .unwrap_or(0);
    prev.saturating_sub(1)
}
