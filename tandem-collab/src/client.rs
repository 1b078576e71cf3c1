//! WebSocket client for editing a shared document.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Local edits buffered and sent once per send interval, one update in
//!   flight at a time
//! - Remote revisions folded into the local view, reported as
//!   [`SyncEvent::RemoteChange`] deltas
//! - Gap recovery through fast-forward requests
//!
//! Edits made while disconnected stay pending and are sent after the next
//! connect, as long as the server has not moved on in the meantime. When the
//! connection drops or the client loses sync, it reconnects and reloads the
//! head unless [`ClientConfig::reconnect`] is off.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use tandem_core::{ChangeSet, ClientDocument, ClientId, EditEvent, ReconcileError, Reconciled};

use crate::protocol::{Message, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTGOING_CAPACITY: usize = 64;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Client timing settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How often pending edits are sent
    pub send_interval_ms: u64,
    /// Send intervals to wait for an acknowledgement before giving up
    pub ack_timeout_ticks: u32,
    /// Reconnect after the connection drops or sync is lost
    pub reconnect: bool,
    /// Pause between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Buffered events for the application; further events are dropped
    /// until the application reads some
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 500,
            ack_timeout_ticks: 6,
            reconnect: true,
            reconnect_delay_ms: 1000,
            event_capacity: 256,
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The server's document replaced the local view
    DocumentLoaded { text: String, revision_number: usize },
    /// Another client's edit; `delta` turns the previous view into `text`
    RemoteChange {
        delta: ChangeSet,
        text: String,
        revision_number: usize,
    },
    /// Our update was committed as `revision_number`
    Acknowledged { revision_number: usize },
    /// Local state no longer lines up with the server
    Desynchronized(String),
    ServerError(String),
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::DocumentLoaded { .. } => "DocumentLoaded",
            Self::RemoteChange { .. } => "RemoteChange",
            Self::Acknowledged { .. } => "Acknowledged",
            Self::Desynchronized(_) => "Desynchronized",
            Self::ServerError(_) => "ServerError",
        }
    }
}

enum Outgoing {
    Send(Message),
    Close,
}

/// How a session ended.
enum SessionEnd {
    /// The application closed the client
    Closed,
    /// Transport failure or lost sync
    Lost,
}

/// Everything the connection task needs, shared with [`SyncClient`].
#[derive(Clone)]
struct Link {
    client_id: ClientId,
    url: String,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    document: Arc<Mutex<ClientDocument>>,
    events: mpsc::Sender<SyncEvent>,
}

/// The sync client.
pub struct SyncClient {
    client_id: ClientId,
    doc_id: Uuid,
    server_url: String,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    document: Arc<Mutex<ClientDocument>>,
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(doc_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_config(doc_id, server_url, ClientConfig::default())
    }

    pub fn with_config(doc_id: Uuid, server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            client_id: Uuid::new_v4(),
            doc_id,
            server_url: server_url.into(),
            document: Arc::new(Mutex::new(ClientDocument::new(config.ack_timeout_ticks))),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    fn link(&self) -> Link {
        Link {
            client_id: self.client_id,
            url: format!("{}/{}", self.server_url.trim_end_matches('/'), self.doc_id),
            config: self.config.clone(),
            state: self.state.clone(),
            document: self.document.clone(),
            events: self.event_tx.clone(),
        }
    }

    /// Connect, join the document and start the connection task.
    ///
    /// Only the first attempt is reported here; later reconnects happen in
    /// the background.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.stop_task();
        *self.state.write().await = ConnectionState::Connecting;

        let link = self.link();
        let mut ws = match dial(&link.url).await {
            Ok(ws) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        if let Err(e) = link.open(&mut ws).await {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        self.outgoing_tx = Some(out_tx);
        self.task = Some(tokio::spawn(link.run(ws, out_rx)));
        Ok(())
    }

    /// Close the connection. Pending local edits are kept.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
        self.document.lock().await.disconnect();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn stop_task(&mut self) {
        self.outgoing_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Apply a local edit to the view. It is sent on the next send
    /// interval. `Ok(None)` means the event did not fit the document and
    /// was skipped.
    pub async fn edit(&self, event: &EditEvent) -> Result<Option<ChangeSet>, ReconcileError> {
        self.document.lock().await.local_edit(event)
    }

    /// The text the user currently sees.
    pub async fn text(&self) -> Result<String, ReconcileError> {
        Ok(self.document.lock().await.text()?)
    }

    /// Last server revision folded into the local state.
    pub async fn revision(&self) -> usize {
        self.document.lock().await.revision()
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Outgoing::Send(Message::Ping))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_task();
    }
}

impl Link {
    /// Join the document on a fresh socket.
    async fn open(&self, ws: &mut WsStream) -> Result<(), ProtocolError> {
        self.document.lock().await.connect();
        send_message(
            ws,
            &Message::NewClientId {
                client_id: self.client_id,
            },
        )
        .await?;
        *self.state.write().await = ConnectionState::Connected;
        emit(&self.events, SyncEvent::Connected);
        Ok(())
    }

    async fn run(self, mut ws: WsStream, mut outgoing: mpsc::Receiver<Outgoing>) {
        loop {
            let end = self.session(&mut ws, &mut outgoing).await;

            self.document.lock().await.disconnect();
            *self.state.write().await = ConnectionState::Disconnected;
            emit(&self.events, SyncEvent::Disconnected);

            if matches!(end, SessionEnd::Closed) || !self.config.reconnect {
                return;
            }
            match self.redial(&mut outgoing).await {
                Some(next) => ws = next,
                None => return,
            }
        }
    }

    /// Retry until a new session is open. `None` if the application closed
    /// the client meanwhile.
    async fn redial(&self, outgoing: &mut mpsc::Receiver<Outgoing>) -> Option<WsStream> {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        *self.state.write().await = ConnectionState::Reconnecting;
        loop {
            tokio::select! {
                cmd = outgoing.recv() => match cmd {
                    Some(Outgoing::Send(msg)) => {
                        log::debug!("Dropping {} while reconnecting", msg.kind());
                        continue;
                    }
                    Some(Outgoing::Close) | None => return None,
                },
                _ = tokio::time::sleep(delay) => {}
            }

            log::info!("Reconnecting to {}", self.url);
            if let Ok(mut ws) = dial(&self.url).await {
                if self.open(&mut ws).await.is_ok() {
                    return Some(ws);
                }
            }
            *self.state.write().await = ConnectionState::Reconnecting;
        }
    }

    async fn session(&self, ws: &mut WsStream, outgoing: &mut mpsc::Receiver<Outgoing>) -> SessionEnd {
        let period = Duration::from_millis(self.config.send_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                frame = ws.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return SessionEnd::Lost,
                        Some(Ok(_)) => continue,
                    };
                    let msg = match Message::decode(text.as_str()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Failed to decode server message: {e}");
                            continue;
                        }
                    };
                    match handle_server_message(msg, &self.document, &self.events).await {
                        Ok(Some(reply)) => {
                            if send_message(ws, &reply).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("Lost sync with server: {e}");
                            emit(&self.events, SyncEvent::Desynchronized(e.to_string()));
                            let _ = ws.close(None).await;
                            return SessionEnd::Lost;
                        }
                    }
                }

                cmd = outgoing.recv() => match cmd {
                    Some(Outgoing::Send(msg)) => {
                        if send_message(ws, &msg).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = ws.close(None).await;
                        return SessionEnd::Closed;
                    }
                },

                _ = ticker.tick() => {
                    // At most one update in flight.
                    let update = self.document.lock().await.take_outgoing();
                    match update {
                        Ok(Some(update)) => {
                            let msg = Message::client_update(update.change_set, update.revision_number);
                            if send_message(ws, &msg).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("{e}; dropping connection");
                            emit(&self.events, SyncEvent::Desynchronized(e.to_string()));
                            let _ = ws.close(None).await;
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }
}

async fn dial(url: &str) -> Result<WsStream, ProtocolError> {
    match tokio_tungstenite::connect_async(url).await {
        Ok((ws, _)) => Ok(ws),
        Err(e) => {
            log::warn!("Failed to connect to {url}: {e}");
            Err(ProtocolError::ConnectionClosed)
        }
    }
}

async fn send_message(ws: &mut WsStream, msg: &Message) -> Result<(), ProtocolError> {
    let text = msg.encode()?;
    ws.send(WsMessage::Text(text.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Hand an event to the application without waiting for it to be read.
/// A full or untaken queue drops the event; syncing carries on.
fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            log::warn!("Event queue full, dropping {}", event.kind());
        }
    }
}

/// Fold one server message into the document. Returns the reply to send,
/// if any.
async fn handle_server_message(
    msg: Message,
    document: &Mutex<ClientDocument>,
    events: &mpsc::Sender<SyncEvent>,
) -> Result<Option<Message>, ReconcileError> {
    let (outcome, revision_number) = match msg {
        Message::ServerHeadText {
            data,
            revision_number: Some(revision_number),
        } => {
            let text = document.lock().await.receive_head(data, revision_number)?;
            log::debug!("Loaded document at revision {revision_number}");
            emit(
                events,
                SyncEvent::DocumentLoaded {
                    text,
                    revision_number,
                },
            );
            return Ok(None);
        }
        Message::ServerUpdate {
            data,
            revision_number,
        } => (
            document.lock().await.apply_server_update(&data, revision_number)?,
            revision_number,
        ),
        Message::ServerAck { revision_number } => {
            (document.lock().await.acknowledge(revision_number)?, revision_number)
        }
        Message::ServerFastForward {
            data,
            revision_number,
        } => (
            document.lock().await.apply_fast_forward(&data, revision_number)?,
            revision_number,
        ),
        Message::Error { message } => {
            log::warn!("Server error: {message}");
            emit(events, SyncEvent::ServerError(message));
            return Ok(None);
        }
        Message::Pong | Message::ServerHeadText { .. } => return Ok(None),
        other => {
            log::debug!("Ignoring unexpected {}", other.kind());
            return Ok(None);
        }
    };

    let reply = match outcome {
        Reconciled::Applied { delta, text } => {
            emit(
                events,
                SyncEvent::RemoteChange {
                    delta,
                    text,
                    revision_number,
                },
            );
            Some(Message::ClientAck { revision_number })
        }
        Reconciled::Acknowledged { revision_number } => {
            emit(events, SyncEvent::Acknowledged { revision_number });
            None
        }
        Reconciled::FastForwardNeeded { from_revision } => {
            log::debug!("Requesting fast-forward from revision {from_revision}");
            Some(Message::ClientFastForward {
                revision_number: from_revision,
            })
        }
        Reconciled::Deferred | Reconciled::Ignored => None,
    };
    Ok(reply)
}

/// Read-only fetch of a document's current text, without joining it.
pub async fn fetch_document(server_url: &str, doc_id: Uuid) -> Result<String, ProtocolError> {
    let url = format!("{}/{}", server_url.trim_end_matches('/'), doc_id);
    let mut ws = dial(&url).await?;
    send_message(&mut ws, &Message::GetDocument).await?;

    while let Some(frame) = ws.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match Message::decode(text.as_str())? {
            Message::ServerHeadText { data, .. } => {
                let _ = ws.close(None).await;
                return data
                    .document_text()
                    .map(str::to_string)
                    .ok_or(ProtocolError::UnexpectedMessage("serverHeadText"));
            }
            Message::Error { message } => return Err(ProtocolError::DeserializationError(message)),
            _ => continue,
        }
    }
    Err(ProtocolError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_document(text: &str, revision: usize) -> Mutex<ClientDocument> {
        let mut document = ClientDocument::new(6);
        document.connect();
        document
            .receive_head(ChangeSet::from_text(text), revision)
            .unwrap();
        Mutex::new(document)
    }

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(doc_id, "ws://localhost:9090");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert!(!client.client_id().is_nil());
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.send_interval_ms, 500);
        assert_eq!(config.ack_timeout_ticks, 6);
        assert!(config.reconnect);
    }

    #[test]
    fn test_link_url_joins_document_path() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(doc_id, "ws://localhost:9090/");
        assert_eq!(client.link().url, format!("ws://localhost:9090/{doc_id}"));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.revision().await, 0);
        assert_eq!(client.text().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_edit_before_load_rejected() {
        let client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.edit(&EditEvent::insert(0, "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_ping_while_disconnected() {
        let client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.send_ping().await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Port 9 (discard) is not a WebSocket server.
        let mut client = SyncClient::new(Uuid::new_v4(), "ws://127.0.0.1:9");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_head_then_remote_update() {
        let document = Mutex::new(ClientDocument::new(6));
        document.lock().await.connect();
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let head = Message::ServerHeadText {
            data: ChangeSet::from_text("abc"),
            revision_number: Some(4),
        };
        let reply = handle_server_message(head, &document, &event_tx).await.unwrap();
        assert_eq!(reply, None);
        assert!(matches!(
            event_rx.recv().await,
            Some(SyncEvent::DocumentLoaded { revision_number: 4, .. })
        ));

        let update = Message::server_update(ChangeSet::splice(3, 3, 0, "d").unwrap(), 5);
        let reply = handle_server_message(update, &document, &event_tx).await.unwrap();
        assert_eq!(reply, Some(Message::ClientAck { revision_number: 5 }));
        match event_rx.recv().await {
            Some(SyncEvent::RemoteChange { text, revision_number, .. }) => {
                assert_eq!(text, "abcd");
                assert_eq!(revision_number, 5);
            }
            other => panic!("Expected RemoteChange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gap_requests_fast_forward() {
        let document = loaded_document("abc", 1);
        let (event_tx, _event_rx) = mpsc::channel(8);

        let update = Message::server_update(ChangeSet::identity(4), 3);
        let reply = handle_server_message(update, &document, &event_tx).await.unwrap();
        assert_eq!(reply, Some(Message::ClientFastForward { revision_number: 1 }));
    }

    #[tokio::test]
    async fn test_ack_reports_committed_revision() {
        let document = loaded_document("abc", 1);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        {
            let mut doc = document.lock().await;
            doc.local_edit(&EditEvent::insert(3, "!")).unwrap();
            assert!(doc.take_outgoing().unwrap().is_some());
        }

        let ack = Message::ServerAck { revision_number: 2 };
        let reply = handle_server_message(ack, &document, &event_tx).await.unwrap();
        assert_eq!(reply, None);
        assert!(matches!(
            event_rx.recv().await,
            Some(SyncEvent::Acknowledged { revision_number: 2 })
        ));
    }

    #[tokio::test]
    async fn test_unexpected_ack_is_an_error() {
        let document = loaded_document("abc", 1);
        let (event_tx, _event_rx) = mpsc::channel(8);

        let ack = Message::ServerAck { revision_number: 2 };
        assert_eq!(
            handle_server_message(ack, &document, &event_tx).await,
            Err(ReconcileError::UnexpectedAck)
        );
    }

    #[tokio::test]
    async fn test_full_event_queue_does_not_stall_updates() {
        let document = loaded_document("", 0);
        let (event_tx, mut event_rx) = mpsc::channel(1);

        for revision in 1..=3 {
            let append = ChangeSet::splice(revision - 1, revision - 1, 0, "x").unwrap();
            let update = Message::server_update(append, revision);
            let reply = handle_server_message(update, &document, &event_tx).await.unwrap();
            assert_eq!(reply, Some(Message::ClientAck { revision_number: revision }));
        }
        assert_eq!(document.lock().await.text().unwrap(), "xxx");

        // Only the first event fit.
        assert!(matches!(
            event_rx.recv().await,
            Some(SyncEvent::RemoteChange { revision_number: 1, .. })
        ));
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_error_becomes_event() {
        let document = loaded_document("", 0);
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let reply = handle_server_message(Message::error("nope"), &document, &event_tx)
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert!(matches!(event_rx.recv().await, Some(SyncEvent::ServerError(m)) if m == "nope"));
    }
}
