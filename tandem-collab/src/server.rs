//! WebSocket document server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌─ DocumentSession (actor) ── DocumentState
//!             ├── /<doc-uuid> ────┤            │
//! Client B ──┘                    │            ▼
//!                                 └─ BroadcastGroup (ordered revisions)
//!                                              │
//!                               ┌──────────────┼──────────────┐
//!                               ▼              ▼              ▼
//!                       serverAck (A)   serverUpdate (B)   serverUpdate (C)
//! ```
//!
//! The document is chosen by the last segment of the request path; a
//! missing or unparsable id selects the nil document. Each connection task
//! forwards client messages to the document's session and relays the
//! session's revisions back, turning the client's own revisions into
//! acknowledgements.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use tandem_core::ClientId;

use crate::broadcast::{RevisionEvent, RoomManager};
use crate::protocol::{Message, ProtocolError};
use crate::session::{DocumentHandle, SessionConfig, SessionError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum clients joined to one document
    pub max_clients_per_document: usize,
    /// Revisions a connection may fall behind before it is closed
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Commands queued per document session
    pub session_mailbox: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_document: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            session_mailbox: 64,
        }
    }
}

impl ServerConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            broadcast_capacity: self.broadcast_capacity,
            mailbox_capacity: self.session_mailbox,
            max_clients: self.max_clients_per_document,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub revisions_integrated: u64,
    pub rejected_updates: u64,
    pub fast_forwards: u64,
}

/// The document server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.session_config()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;
        let doc_id = document_id_from_path(&path);
        let (ws_sender, ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection from {addr} for document {doc_id}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut connection = Connection {
            addr,
            doc_id,
            rooms: rooms.clone(),
            stats: stats.clone(),
            sink: ws_sender,
            client_id: None,
            ticket: 0,
            room: None,
            events: None,
        };
        let result = connection
            .run(ws_receiver, Duration::from_secs(config.heartbeat_interval_secs.max(1)))
            .await;

        if let (Some(client_id), Some(room)) = (connection.client_id, &connection.room) {
            room.leave(client_id, connection.ticket).await;
            log::info!("Client {client_id} left document {doc_id}");
        }
        drop(connection);
        rooms.remove_if_empty(&doc_id).await;

        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.room_count().await;

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Last non-empty path segment as a document id, the nil document otherwise.
pub fn document_id_from_path(path: &str) -> Uuid {
    match path.rsplit('/').find(|segment| !segment.is_empty()) {
        None => Uuid::nil(),
        Some(segment) => Uuid::parse_str(segment).unwrap_or_else(|_| {
            log::warn!("Invalid document id {segment:?}, using the default document");
            Uuid::nil()
        }),
    }
}

/// One client connection.
struct Connection {
    addr: SocketAddr,
    doc_id: Uuid,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    sink: WsSink,
    client_id: Option<ClientId>,
    ticket: u64,
    room: Option<DocumentHandle>,
    events: Option<broadcast::Receiver<Arc<RevisionEvent>>>,
}

/// Whether the connection loop should keep going.
enum Flow {
    Continue,
    Close,
}

impl Connection {
    async fn run(&mut self, mut source: WsSource, heartbeat_period: Duration) -> Result<(), BoxError> {
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match Message::decode(text.as_str()) {
                                Ok(msg) => {
                                    if let Flow::Close = self.handle_message(msg).await? {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {}: {e}", self.addr);
                                    self.send(&Message::error(e.to_string())).await?;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            self.sink.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            log::warn!("Ignoring binary frame from {}", self.addr);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                    }
                }

                event = async {
                    match self.events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Ok(event) => self.relay(&event).await?,
                        Err(RecvError::Lagged(n)) => {
                            log::warn!(
                                "Client {:?} lagged by {n} revisions, closing connection",
                                self.client_id
                            );
                            if let Some(room) = &self.room {
                                room.broadcast().record_lag(n);
                            }
                            self.send(&Message::error("lagged behind the document; reconnect")).await?;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    self.sink.send(WsMessage::Ping(Default::default())).await?;
                }
            }
        }

        Ok(())
    }

    async fn send(&mut self, msg: &Message) -> Result<(), BoxError> {
        let text = msg.encode()?;
        self.sink.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// The client's own revisions become acknowledgements.
    async fn relay(&mut self, event: &RevisionEvent) -> Result<(), BoxError> {
        let msg = if Some(event.origin) == self.client_id {
            Message::ServerAck {
                revision_number: event.revision_number,
            }
        } else {
            Message::server_update(event.change_set.clone(), event.revision_number)
        };
        self.send(&msg).await
    }

    fn joined(&self) -> Option<(ClientId, DocumentHandle)> {
        Some((self.client_id?, self.room.clone()?))
    }

    async fn handle_message(&mut self, msg: Message) -> Result<Flow, BoxError> {
        match msg {
            Message::NewClientId { client_id } => {
                if self.client_id.is_some() {
                    self.send(&Message::error("already joined")).await?;
                    return Ok(Flow::Continue);
                }
                let (room, joined) = self
                    .rooms
                    .with_room(self.doc_id, |room| async move {
                        let joined = room.join(client_id).await;
                        (room, joined)
                    })
                    .await;
                match joined {
                    Ok(joined) => {
                        self.client_id = Some(client_id);
                        self.ticket = joined.ticket;
                        self.room = Some(room);
                        self.events = Some(joined.events);
                        self.send(&Message::ServerHeadText {
                            data: joined.head,
                            revision_number: Some(joined.revision_number),
                        })
                        .await?;
                    }
                    Err(e @ SessionError::DocumentFull { .. }) => {
                        log::warn!("Refusing {client_id}: {e}");
                        self.send(&Message::error(e.to_string())).await?;
                        return Ok(Flow::Close);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            Message::GetDocument => {
                let room = match &self.room {
                    Some(room) => room.clone(),
                    None => self.rooms.get_or_create(self.doc_id).await,
                };
                let (head, _) = room.document().await?;
                self.send(&Message::ServerHeadText {
                    data: head,
                    revision_number: None,
                })
                .await?;
            }

            Message::ClientUpdate {
                data,
                revision_number,
            } => {
                let Some((client_id, room)) = self.joined() else {
                    self.send(&Message::error("join with newClientId first")).await?;
                    return Ok(Flow::Continue);
                };
                match room.update(client_id, data, revision_number).await {
                    Ok(revision) => {
                        log::debug!("Integrated revision {revision} from {client_id}");
                        self.stats.write().await.revisions_integrated += 1;
                    }
                    Err(SessionError::Closed(doc_id)) => return Err(SessionError::Closed(doc_id).into()),
                    Err(e) => {
                        self.stats.write().await.rejected_updates += 1;
                        self.send(&Message::error(e.to_string())).await?;
                    }
                }
            }

            Message::ClientFastForward { revision_number } => {
                let Some((client_id, room)) = self.joined() else {
                    self.send(&Message::error("join with newClientId first")).await?;
                    return Ok(Flow::Continue);
                };
                match room.fast_forward(client_id, revision_number).await {
                    Ok(integrated) => {
                        self.stats.write().await.fast_forwards += 1;
                        self.send(&Message::ServerFastForward {
                            data: integrated.change_set,
                            revision_number: integrated.revision_number,
                        })
                        .await?;
                    }
                    Err(SessionError::Closed(doc_id)) => return Err(SessionError::Closed(doc_id).into()),
                    Err(e) => self.send(&Message::error(e.to_string())).await?,
                }
            }

            Message::ClientAck { revision_number } => {
                if let Some((client_id, room)) = self.joined() {
                    room.acknowledge(client_id, revision_number).await?;
                }
            }

            Message::Ping => self.send(&Message::Pong).await?,
            Message::Pong => {}

            other => {
                log::debug!("Unexpected {} from {}", other.kind(), self.addr);
                let err = ProtocolError::UnexpectedMessage(other.kind());
                self.send(&Message::error(err.to_string())).await?;
            }
        }

        Ok(Flow::Continue)
    }
}
