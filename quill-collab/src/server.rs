//! Room registry and connection handling.
//!
//! Architecture:
//! ```text
//! WebSocket ─► handshake (identity headers, Hello) ─► CollabServer
//!                                                        │ rooms: doc_id → Arc<Room>
//!                                                        ▼
//!                                           Room ── publish/consume ── DistributedLog
//!                                            │
//!                         ┌──────────────────┼──────────────────┐
//!                         ▼                  ▼                  ▼
//!                     send loop A        send loop B        send loop C
//! ```
//!
//! Rooms are created lazily on the first join for a document and removed
//! when their last local client leaves. Joins and leaves hold the registry
//! lock so a room is never handed out after it was shut down. Nothing holds
//! the registry lock across network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broker::{room_subject, DistributedLog};
use crate::client::{ClientConnection, ClientIdentity, OutboundFrame};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::metrics::{CollabMetrics, ServerStats};
use crate::protocol::{ClientId, ClientMessage, DocumentId, Role, ServerFrame, ServerMessage};
use crate::room::Room;

/// The relay: one per process and category.
#[derive(Clone)]
pub struct CollabServer {
    config: Arc<ServerConfig>,
    log: Arc<dyn DistributedLog>,
    rooms: Arc<Mutex<HashMap<DocumentId, Arc<Room>>>>,
    metrics: Arc<CollabMetrics>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, log: Arc<dyn DistributedLog>) -> Self {
        let metrics = Arc::new(CollabMetrics::new(config.category.clone()));
        Self {
            config: Arc::new(config),
            log,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CollabMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> ServerStats {
        self.metrics.snapshot()
    }

    /// Make sure the category's log stream exists. Safe to call repeatedly.
    pub async fn start(&self) -> Result<(), CollabError> {
        let stream = self.config.stream_config();
        log::info!(
            "Ensuring log stream {} ({:?}, max age {:?})",
            stream.name,
            stream.subjects,
            stream.max_age
        );
        self.log.ensure_stream(stream).await?;
        Ok(())
    }

    /// Start, bind `config.bind_addr` and accept connections forever.
    pub async fn run(&self) -> Result<(), CollabError> {
        self.start().await?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// WebSocket upgrade plus [`CollabServer::handle_stream`].
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), CollabError> {
        let mut identity = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match ClientIdentity::from_headers(req.headers()) {
                Ok(id) => {
                    identity = Some(id);
                    Ok(resp)
                }
                Err(e) => {
                    log::warn!("Rejecting upgrade from {addr}: {e}");
                    Err(unauthorized(&e))
                }
            }
        })
        .await?;
        let identity = identity.ok_or(CollabError::ConnectionClosed)?;
        log::info!(
            "WebSocket connection from {addr} for user {} ({:?})",
            identity.user_id,
            identity.role
        );

        let (ws_sink, ws_stream) = ws.split();
        let writer = ws_sink.with(|frame: OutboundFrame| {
            future::ready(
                frame
                    .encode()
                    .map(|bytes| Message::Binary(bytes.into()))
                    .map_err(CollabError::from),
            )
        });
        let reader = ws_stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => {
                    Some(ClientMessage::decode(&data).map_err(CollabError::from))
                }
                Ok(Message::Close(_)) => Some(Err(CollabError::ConnectionClosed)),
                Ok(_) => None,
                Err(e) => Some(Err(CollabError::from(e))),
            })
        });

        self.handle_stream(identity, reader, writer).await
    }

    /// Drive one connection over any framed transport.
    ///
    /// Performs the Hello handshake, joins the room, spawns the send loop
    /// and reads until the stream ends. Always leaves the room on exit.
    pub async fn handle_stream<R, W>(
        &self,
        identity: ClientIdentity,
        mut reader: R,
        writer: W,
    ) -> Result<(), CollabError>
    where
        R: Stream<Item = Result<ClientMessage, CollabError>> + Unpin + Send,
        W: Sink<OutboundFrame, Error = CollabError> + Unpin + Send + 'static,
    {
        let client_id = identity.client_id();
        let first = match reader.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                return Err(CollabError::InvalidArgument(format!(
                    "unreadable first frame: {e}"
                )))
            }
            None => {
                return Err(CollabError::InvalidArgument(
                    "stream ended before hello".to_string(),
                ))
            }
        };
        let document_id = match handle_first_msg(first) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Rejecting client {}: {}", client_id, e);
                return Err(e);
            }
        };

        let (conn, queue) = ClientConnection::new(
            client_id,
            identity.user_id,
            identity.role,
            document_id,
            self.config.client_queue_capacity,
        );
        conn.send(Arc::new(ServerFrame::client_id_assigned(client_id)));

        let room = self.join_room(document_id, conn).await?;
        let mut send_task = tokio::spawn(async move {
            if let Err(e) = queue.run(writer).await {
                log::debug!("Send loop for client {} failed: {}", client_id, e);
            }
        });

        let result = self
            .read_loop(&room, identity.role, client_id, &mut reader, &mut send_task)
            .await;
        self.leave_room(&room, client_id).await;
        result
    }

    async fn read_loop<R>(
        &self,
        room: &Room,
        role: Role,
        client_id: ClientId,
        reader: &mut R,
        send_task: &mut JoinHandle<()>,
    ) -> Result<(), CollabError>
    where
        R: Stream<Item = Result<ClientMessage, CollabError>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                next = reader.next() => next,
                _ = &mut *send_task => {
                    log::debug!("Send loop for client {} ended, closing connection", client_id);
                    return Ok(());
                }
            };
            let msg = match next {
                None | Some(Err(CollabError::ConnectionClosed)) => return Ok(()),
                Some(Err(CollabError::Protocol(e))) => {
                    log::warn!("Ignoring unreadable frame from client {}: {}", client_id, e);
                    continue;
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(msg)) => msg,
            };
            dispatch(room, role, client_id, msg).await;
        }
    }

    /// Existing room for `document_id`, or a new one with its fan-in task
    /// running. Only called under the registry lock, immediately followed by
    /// a join, so no room is registered without a client.
    fn get_or_create_room(
        &self,
        rooms: &mut HashMap<DocumentId, Arc<Room>>,
        document_id: DocumentId,
    ) -> (Arc<Room>, bool) {
        if let Some(room) = rooms.get(&document_id) {
            return (Arc::clone(room), false);
        }
        let room = Arc::new(Room::new(
            document_id,
            self.config.category.clone(),
            Arc::clone(&self.log),
            Arc::clone(&self.metrics),
        ));
        rooms.insert(document_id, Arc::clone(&room));
        self.metrics.room_created();
        log::info!("Created room for document {} ({} rooms)", document_id, rooms.len());

        tokio::spawn(Arc::clone(&room).consume_loop(self.config.fan_in()));
        (room, true)
    }

    async fn join_room(
        &self,
        document_id: DocumentId,
        conn: ClientConnection,
    ) -> Result<Arc<Room>, CollabError> {
        let mut rooms = self.rooms.lock().await;
        let (room, created) = self.get_or_create_room(&mut rooms, document_id);
        if let Err(e) = room.join(conn).await {
            if created {
                room.shutdown();
                rooms.remove(&document_id);
                self.metrics.room_removed();
            }
            return Err(e);
        }
        Ok(room)
    }

    async fn leave_room(&self, room: &Arc<Room>, client_id: ClientId) {
        let departure = {
            let mut rooms = self.rooms.lock().await;
            let Some(departure) = room.leave(client_id).await else {
                return;
            };
            if departure.now_empty {
                room.shutdown();
                let document_id = room.document_id();
                if rooms
                    .get(&document_id)
                    .is_some_and(|current| Arc::ptr_eq(current, room))
                {
                    rooms.remove(&document_id);
                    self.metrics.room_removed();
                    log::info!("Removed empty room for document {}", document_id);
                }
            }
            departure
        };

        if !departure.now_empty {
            room.broadcast_offline(client_id, departure.offline_clock()).await;
        }
    }

    pub async fn room(&self, document_id: DocumentId) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(&document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Tell every editor of `document_id`, on every relay, that it was saved.
    pub async fn notify_target_saved(&self, document_id: DocumentId) -> Result<(), CollabError> {
        if let Some(room) = self.room(document_id).await {
            room.send_target_saved().await;
            return Ok(());
        }
        let payload = ServerFrame::target_saved(document_id).encode()?;
        self.log
            .publish(room_subject(&self.config.category, document_id), payload, None)
            .await?;
        Ok(())
    }

    /// Returns `false` when no local room exists for the document.
    pub async fn broadcast_sync_step1(
        &self,
        document_id: DocumentId,
        from: ClientId,
        state_vector: Vec<u8>,
    ) -> bool {
        match self.room(document_id).await {
            Some(room) => {
                room.broadcast_sync_step1(from, state_vector).await;
                true
            }
            None => false,
        }
    }

    pub async fn send_sync_step2(
        &self,
        document_id: DocumentId,
        from: ClientId,
        to: ClientId,
        update: Vec<u8>,
    ) -> bool {
        match self.room(document_id).await {
            Some(room) => room.send_sync_step2(from, to, update).await,
            None => false,
        }
    }
}

/// Validate the first frame of a connection and return its document id.
pub fn handle_first_msg(msg: ClientMessage) -> Result<DocumentId, CollabError> {
    match msg {
        ClientMessage::Hello {
            target_document_id: 0,
        } => Err(CollabError::InvalidArgument(
            "hello must name a non-zero document".to_string(),
        )),
        ClientMessage::Hello { target_document_id } => Ok(target_document_id),
        _ => Err(CollabError::InvalidArgument(
            "first frame must be hello".to_string(),
        )),
    }
}

async fn dispatch(room: &Room, role: Role, client_id: ClientId, msg: ClientMessage) {
    match msg {
        ClientMessage::Hello { .. } => {
            log::debug!("Ignoring repeated hello from client {}", client_id);
        }
        ClientMessage::ContentUpdate { update } => {
            if role.can_write() {
                room.broadcast(client_id, ServerMessage::ContentUpdate { update }).await;
            } else {
                log::trace!("Dropping content update from read-only client {}", client_id);
            }
        }
        ClientMessage::AwarenessPing { update } => {
            room.broadcast(client_id, ServerMessage::AwarenessPing { update }).await;
        }
        ClientMessage::SyncStep1 { state_vector } => {
            room.broadcast_sync_step1(client_id, state_vector).await;
        }
        ClientMessage::SyncStep2 { to, update } => {
            if role.can_write() {
                room.send_sync_step2(client_id, to, update).await;
            } else {
                log::trace!("Dropping sync step 2 from read-only client {}", client_id);
            }
        }
    }
}

fn unauthorized(reason: &CollabError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
