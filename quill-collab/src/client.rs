//! Per-connection handle and its outbound send loop.
//!
//! ```text
//! Room fan-out ── try_send ──► [bounded queue] ── OutboundQueue::run ──► editor stream
//!                  (drop when full)               (single writer, FIFO)
//! ```
//!
//! The queue is the only handoff between a room and a slow editor, so no
//! lock is ever held across a network write.

use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{ClientId, DocumentId, Role, ServerFrame};

/// Default bound of every client's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Client ids stay below 2^53 so editors can hold them in a double.
pub const MAX_CLIENT_ID: ClientId = (1 << 53) - 1;

pub const USER_HEADER: &str = "x-quill-user";
pub const SESSION_HEADER: &str = "x-quill-session";
pub const ROLE_HEADER: &str = "x-quill-role";

const CLIENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5d0c_2a8e_91f4_4b6a_8c37_1e2f_a9b0_64d3);

/// Frames are shared between every recipient of a broadcast.
pub type OutboundFrame = Arc<ServerFrame>;

/// Who is on the other end of a connection, as established by the
/// authentication layer in front of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
}

impl ClientIdentity {
    pub fn new(user_id: Uuid, session_id: Uuid, role: Role) -> Self {
        Self {
            user_id,
            session_id,
            role,
        }
    }

    pub fn client_id(&self) -> ClientId {
        derive_client_id(self.user_id, self.session_id)
    }

    /// Read the identity headers of a WebSocket upgrade request.
    ///
    /// The user header is required. A missing session gets a fresh id and a
    /// missing role means read-only.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, CollabError> {
        let user = header_str(headers, USER_HEADER)
            .ok_or_else(|| CollabError::InvalidArgument(format!("missing {USER_HEADER} header")))?;
        let user_id = parse_uuid(USER_HEADER, user)?;

        let session_id = match header_str(headers, SESSION_HEADER) {
            Some(session) => parse_uuid(SESSION_HEADER, session)?,
            None => Uuid::new_v4(),
        };

        let role = match header_str(headers, ROLE_HEADER) {
            Some(role) => role.parse::<Role>()?,
            None => Role::Reader,
        };

        Ok(Self::new(user_id, session_id, role))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_uuid(header: &str, value: &str) -> Result<Uuid, CollabError> {
    Uuid::parse_str(value.trim())
        .map_err(|e| CollabError::InvalidArgument(format!("bad {header} header: {e}")))
}

/// Deterministic connection id for a (user, session) pair.
pub fn derive_client_id(user_id: Uuid, session_id: Uuid) -> ClientId {
    let mut name = [0u8; 32];
    name[..16].copy_from_slice(user_id.as_bytes());
    name[16..].copy_from_slice(session_id.as_bytes());
    let digest = Uuid::new_v5(&CLIENT_ID_NAMESPACE, &name);
    (digest.as_u128() as u64) & MAX_CLIENT_ID
}

/// A connected editor as seen by its room.
///
/// Dropping the connection closes its queue, which ends the send loop.
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    user_id: Uuid,
    role: Role,
    document_id: DocumentId,
    tx: mpsc::Sender<OutboundFrame>,
}

impl ClientConnection {
    pub fn new(
        id: ClientId,
        user_id: Uuid,
        role: Role,
        document_id: DocumentId,
        capacity: usize,
    ) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id,
            user_id,
            role,
            document_id,
            tx,
        };
        (conn, OutboundQueue { client_id: id, rx })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Non-blocking enqueue. Returns `false` when the frame was dropped.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                log::warn!(
                    "Outbound queue full for client {} on document {}, dropping {}",
                    self.id,
                    self.document_id,
                    frame.message.kind()
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Client {} send loop already gone", self.id);
                false
            }
        }
    }

    /// Frames waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a client's queue, drained by [`OutboundQueue::run`].
#[derive(Debug)]
pub struct OutboundQueue {
    client_id: ClientId,
    rx: mpsc::Receiver<OutboundFrame>,
}

impl OutboundQueue {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    /// Send loop: write frames in enqueue order until the queue closes.
    ///
    /// Returns on the first write error. Once the owning connection is
    /// dropped the writer is closed.
    pub async fn run<W>(mut self, mut writer: W) -> Result<(), CollabError>
    where
        W: Sink<OutboundFrame, Error = CollabError> + Unpin,
    {
        while let Some(frame) = self.rx.recv().await {
            log::trace!("-> client {}: {}", self.client_id, frame.message.kind());
            if let Err(e) = writer.send(frame).await {
                log::debug!("Send loop for client {} stopped: {}", self.client_id, e);
                return Err(e);
            }
        }
        writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_util::sync::PollSender;

    fn update(byte: u8) -> OutboundFrame {
        Arc::new(ServerFrame::from_client(
            1,
            ServerMessage::ContentUpdate { update: vec![byte] },
        ))
    }

    #[test]
    fn test_client_id_is_deterministic_and_clamped() {
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let a = derive_client_id(user, session);
        assert_eq!(a, derive_client_id(user, session));
        assert!(a <= MAX_CLIENT_ID);
        assert_ne!(a, derive_client_id(user, Uuid::new_v4()));
    }

    #[test]
    fn test_client_id_clamp_many() {
        for _ in 0..1_000 {
            assert!(derive_client_id(Uuid::new_v4(), Uuid::new_v4()) < (1u64 << 53));
        }
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (conn, _queue) = ClientConnection::new(1, Uuid::new_v4(), Role::Writer, 9, 2);
        assert!(conn.send(update(1)));
        assert!(conn.send(update(2)));
        assert!(!conn.send(update(3)));
        assert_eq!(conn.queued(), 2);
        assert_eq!(conn.capacity(), 2);
    }

    #[test]
    fn test_send_after_queue_dropped() {
        let (conn, queue) = ClientConnection::new(1, Uuid::new_v4(), Role::Reader, 9, 4);
        drop(queue);
        assert!(conn.is_closed());
        assert!(!conn.send(update(1)));
    }

    #[tokio::test]
    async fn test_send_loop_preserves_order() {
        let (conn, queue) = ClientConnection::new(1, Uuid::new_v4(), Role::Writer, 9, 8);
        let (tx, mut rx) = mpsc::channel(8);
        let writer = PollSender::new(tx).sink_map_err(|_| CollabError::ConnectionClosed);
        let task = tokio::spawn(queue.run(writer));

        for i in 0..5 {
            assert!(conn.send(update(i)));
        }
        drop(conn);
        task.await.unwrap().unwrap();

        for i in 0..5 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame, update(i));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_loop_stops_on_write_error() {
        let (conn, queue) = ClientConnection::new(1, Uuid::new_v4(), Role::Writer, 9, 8);
        let (tx, rx) = mpsc::channel::<OutboundFrame>(8);
        drop(rx);
        let writer = PollSender::new(tx).sink_map_err(|_| CollabError::ConnectionClosed);

        conn.send(update(1));
        let result = queue.run(writer).await;
        assert!(matches!(result, Err(CollabError::ConnectionClosed)));
    }

    #[test]
    fn test_identity_from_headers() {
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(&user.to_string()).unwrap());
        headers.insert(SESSION_HEADER, HeaderValue::from_str(&session.to_string()).unwrap());
        headers.insert(ROLE_HEADER, HeaderValue::from_static("writer"));

        let identity = ClientIdentity::from_headers(&headers).unwrap();
        assert_eq!(identity, ClientIdentity::new(user, session, Role::Writer));
        assert_eq!(identity.client_id(), derive_client_id(user, session));
    }

    #[test]
    fn test_identity_defaults_to_reader() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap());
        let identity = ClientIdentity::from_headers(&headers).unwrap();
        assert_eq!(identity.role, Role::Reader);
    }

    #[test]
    fn test_identity_rejects_missing_or_bad_user() {
        assert!(matches!(
            ClientIdentity::from_headers(&HeaderMap::new()),
            Err(CollabError::InvalidArgument(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(ClientIdentity::from_headers(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap());
        headers.insert(ROLE_HEADER, HeaderValue::from_static("admin"));
        assert!(matches!(
            ClientIdentity::from_headers(&headers),
            Err(CollabError::Protocol(_))
        ));
    }
}
