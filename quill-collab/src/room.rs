//! Per-document hub bridging local editors and the distributed log.
//!
//! ```text
//!                       ┌──────────── Room (doc 7) ─────────────┐
//! editor A ─ frames ──► │ broadcast ─┬─► forward_to_local ──────┼──► editor B queue
//!                       │            └─► publish docs.7 ──┐     │
//!                       │                                 ▼     │
//!                       │ consume_loop ◄── fetch/ack ── log ◄───┼── other relays
//!                       │      └──────► forward_to_local        │
//!                       └───────────────────────────────────────┘
//! ```
//!
//! Local peers get every broadcast twice when fan-in is running: once from
//! the immediate local forward and once when the published copy comes back
//! through the log. Presence clocks and CRDT merges make the repeat harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quill_awareness::{encode_remove_update, max_clock_for};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{room_subject, DistributedLog, LogError, PullConsumer};
use crate::client::{ClientConnection, OutboundFrame};
use crate::config::FanInSettings;
use crate::error::CollabError;
use crate::metrics::CollabMetrics;
use crate::protocol::{ClientId, DocumentId, ServerFrame, ServerMessage, SyncStep};

struct LocalClient {
    conn: ClientConnection,
    /// Highest awareness clock seen in this client's own pings
    awareness_clock: AtomicU64,
}

/// What is left behind when a client leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub client_id: ClientId,
    /// The room has no local clients left and should be shut down.
    pub now_empty: bool,
    pub last_awareness_clock: Option<u64>,
}

impl Departure {
    /// Clock for the synthetic offline entry. Must beat anything peers hold.
    pub fn offline_clock(&self) -> u64 {
        self.last_awareness_clock.map_or(1, |clock| clock + 1)
    }
}

pub struct Room {
    document_id: DocumentId,
    category: String,
    subject: String,
    clients: RwLock<HashMap<ClientId, LocalClient>>,
    log: Arc<dyn DistributedLog>,
    metrics: Arc<CollabMetrics>,
    lifetime: CancellationToken,
    fan_in_active: watch::Sender<bool>,
    publisher_id: Uuid,
    publish_seq: AtomicU64,
}

impl Room {
    pub fn new(
        document_id: DocumentId,
        category: impl Into<String>,
        log: Arc<dyn DistributedLog>,
        metrics: Arc<CollabMetrics>,
    ) -> Self {
        let category = category.into();
        let (fan_in_active, _) = watch::channel(false);
        Self {
            document_id,
            subject: room_subject(&category, document_id),
            category,
            clients: RwLock::new(HashMap::new()),
            log,
            metrics,
            lifetime: CancellationToken::new(),
            fan_in_active,
            publisher_id: Uuid::new_v4(),
            publish_seq: AtomicU64::new(0),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Log subject this room publishes to and consumes from.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn join(&self, conn: ClientConnection) -> Result<(), CollabError> {
        let id = conn.id();
        let mut clients = self.clients.write().await;
        if clients.contains_key(&id) {
            return Err(CollabError::DuplicateClient(id));
        }
        clients.insert(
            id,
            LocalClient {
                conn,
                awareness_clock: AtomicU64::new(0),
            },
        );
        self.metrics.client_joined();
        log::info!(
            "Client {} joined document {} ({} local)",
            id,
            self.document_id,
            clients.len()
        );
        Ok(())
    }

    /// Remove a client and close its outbound queue.
    pub async fn leave(&self, client_id: ClientId) -> Option<Departure> {
        let mut clients = self.clients.write().await;
        let client = clients.remove(&client_id)?;
        let now_empty = clients.is_empty();
        drop(clients);

        self.metrics.client_left();
        log::info!("Client {} left document {}", client_id, self.document_id);

        let clock = client.awareness_clock.load(Ordering::Relaxed);
        Some(Departure {
            client_id,
            now_empty,
            last_awareness_clock: (clock > 0).then_some(clock),
        })
    }

    /// Fan a client's message out to local peers and the log.
    pub async fn broadcast(&self, from: ClientId, message: ServerMessage) {
        if message.is_empty_payload() {
            log::trace!("Skipping empty {} from {}", message.kind(), from);
            return;
        }
        if let ServerMessage::AwarenessPing { update } = &message {
            if let Err(e) = self.record_awareness_clock(from, update).await {
                log::debug!("Unreadable awareness ping from {}: {}", from, e);
            }
        }
        self.broadcast_frame(ServerFrame::from_client(from, message)).await;
    }

    async fn broadcast_frame(&self, frame: ServerFrame) {
        let frame = Arc::new(frame);
        self.forward_to_local(frame.sender_id, Arc::clone(&frame)).await;
        self.publish(&frame).await;
    }

    /// Best-effort publish; failures only cost cross-process delivery.
    async fn publish(&self, frame: &ServerFrame) {
        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode frame for {}: {}", self.subject, e);
                self.metrics.publish_failed();
                return;
            }
        };
        let seq = self.publish_seq.fetch_add(1, Ordering::Relaxed);
        let msg_id = format!("{}-{}", self.publisher_id, seq);
        match self
            .log
            .publish(self.subject.clone(), payload, Some(msg_id))
            .await
        {
            Ok(_) => self.metrics.message_published(),
            Err(e) => {
                log::error!("Publish to {} failed: {}", self.subject, e);
                self.metrics.publish_failed();
            }
        }
    }

    /// Remember the highest clock `from` announced for itself.
    async fn record_awareness_clock(
        &self,
        from: ClientId,
        update: &[u8],
    ) -> Result<(), CollabError> {
        if let Some(clock) = max_clock_for(update, from)? {
            if let Some(client) = self.clients.read().await.get(&from) {
                client.awareness_clock.fetch_max(clock, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Deliver to every local client except `from`. Returns how many queues
    /// accepted the frame.
    pub async fn forward_to_local(&self, from: Option<ClientId>, frame: OutboundFrame) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        let mut dropped = 0;
        for (id, client) in clients.iter() {
            if Some(*id) == from {
                continue;
            }
            if client.conn.send(Arc::clone(&frame)) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        drop(clients);
        self.metrics.messages_dropped(dropped);
        delivered
    }

    /// Unicast to one local client. Targets attached to other relays are
    /// not reachable.
    pub async fn send_to_client(
        &self,
        from: ClientId,
        to: ClientId,
        message: ServerMessage,
    ) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&to) {
            Some(client) => {
                let sent = client
                    .conn
                    .send(Arc::new(ServerFrame::from_client(from, message)));
                if !sent {
                    self.metrics.messages_dropped(1);
                }
                sent
            }
            None => {
                log::warn!(
                    "Client {} is not attached to document {} here, dropping {} from {}",
                    to,
                    self.document_id,
                    message.kind(),
                    from
                );
                false
            }
        }
    }

    /// Announce a state vector to the whole room.
    pub async fn broadcast_sync_step1(&self, from: ClientId, state_vector: Vec<u8>) {
        self.broadcast(
            from,
            ServerMessage::SyncStep {
                step: SyncStep::One,
                payload: state_vector,
            },
        )
        .await;
    }

    /// Answer a peer's step 1 with the updates it is missing.
    pub async fn send_sync_step2(&self, from: ClientId, to: ClientId, update: Vec<u8>) -> bool {
        self.send_to_client(
            from,
            to,
            ServerMessage::SyncStep {
                step: SyncStep::Two,
                payload: update,
            },
        )
        .await
    }

    /// Tell every editor of this document that it has been persisted.
    pub async fn send_target_saved(&self) {
        self.broadcast_frame(ServerFrame::target_saved(self.document_id)).await;
    }

    /// Presence update marking `client_id` offline, sent on its behalf.
    pub async fn broadcast_offline(&self, client_id: ClientId, clock: u64) {
        let update = encode_remove_update(client_id, clock);
        self.broadcast(client_id, ServerMessage::AwarenessPing { update }).await;
    }

    /// Stop the fan-in task. Idempotent.
    pub fn shutdown(&self) {
        if !self.lifetime.is_cancelled() {
            log::info!("Shutting down room for document {}", self.document_id);
        }
        self.lifetime.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn has_client(&self, client_id: ClientId) -> bool {
        self.clients.read().await.contains_key(&client_id)
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().copied().collect()
    }

    /// Whether the fan-in task currently holds a log subscription.
    pub fn fan_in_active(&self) -> bool {
        *self.fan_in_active.borrow()
    }

    /// Wait until the fan-in subscription state equals `active`.
    pub async fn wait_fan_in(&self, active: bool) {
        let mut rx = self.fan_in_active.subscribe();
        let _ = rx.wait_for(|current| *current == active).await;
    }

    /// Fan-in task: runs until the room shuts down, or until the first hard
    /// consumer error when re-subscription is disabled.
    pub(crate) async fn consume_loop(self: Arc<Self>, settings: FanInSettings) {
        loop {
            let subscribed = tokio::select! {
                _ = self.lifetime.cancelled() => break,
                result = self.log.pull_consumer(
                    settings.stream.clone(),
                    self.subject.clone(),
                    settings.consumer,
                ) => result,
            };

            let outcome = match subscribed {
                Ok(consumer) => {
                    self.fan_in_active.send_replace(true);
                    log::debug!("Fan-in subscribed to {}", self.subject);
                    self.drain(consumer, &settings).await
                }
                Err(e) => Err(e),
            };
            self.fan_in_active.send_replace(false);

            let Err(e) = outcome else {
                break;
            };
            let Some(backoff) = settings.resubscribe else {
                log::error!(
                    "Fan-in for {} stopped: {}. Document {} is local-only from now on",
                    self.subject,
                    e,
                    self.document_id
                );
                break;
            };
            log::warn!(
                "Fan-in for {} failed: {}. Re-subscribing in {:?}",
                self.subject,
                e,
                backoff
            );
            tokio::select! {
                _ = self.lifetime.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        self.fan_in_active.send_replace(false);
        log::debug!("Fan-in for {} exited", self.subject);
    }

    /// Pull, forward, ack. `Ok` means the room was shut down.
    async fn drain(
        &self,
        mut consumer: Box<dyn PullConsumer>,
        settings: &FanInSettings,
    ) -> Result<(), LogError> {
        loop {
            let batch = tokio::select! {
                _ = self.lifetime.cancelled() => return Ok(()),
                batch = consumer.fetch(settings.batch, settings.max_wait) => batch?,
            };
            for msg in batch {
                match ServerFrame::decode(&msg.payload) {
                    Ok(frame) => {
                        self.metrics.remote_message();
                        let sender = frame.sender_id;
                        self.forward_to_local(sender, Arc::new(frame)).await;
                    }
                    Err(e) => log::warn!(
                        "Dropping undecodable message {} on {}: {}",
                        msg.sequence,
                        msg.subject,
                        e
                    ),
                }
                if let Err(e) = msg.ack().await {
                    log::warn!("Ack of {} on {} failed: {}", msg.sequence, msg.subject, e);
                }
            }
        }
    }
}
