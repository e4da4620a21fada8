//! WebSocket editor client for connecting to the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Verbatim delta send/receive
//! - Title and cursor updates
//! - Periodic snapshot autosave (2 s by default)

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::protocol::{CursorRange, EventKind, Identity, ProtocolError, WireMessage};

/// How often the autosave loop pushes a dirty snapshot to the server.
pub const SAVE_INTERVAL: Duration = Duration::from_millis(2000);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
}

/// Events emitted by the editor client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial document snapshot after a join
    DocumentLoaded { content: Vec<u8>, title: String },
    /// The join was rejected by the server
    LoadFailed(String),
    /// A remote member's edit operations, verbatim
    RemoteEdit { origin: Uuid, ops: Vec<u8> },
    /// A remote member renamed the document
    TitleChanged { origin: Uuid, title: String },
    /// Full membership list for the room
    Presence(Vec<Identity>),
    /// A remote member moved their cursor
    RemoteCursor {
        origin: Uuid,
        identity: Identity,
        range: CursorRange,
    },
}

/// The editor client.
///
/// Manages a WebSocket connection to the relay server, relays local edits,
/// and autosaves the editor's latest snapshot on a fixed interval.
pub struct EditorClient {
    /// Who we claim to be in the room
    identity: Identity,

    /// Document we're editing
    doc_id: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Latest full snapshot from the editor, pushed by the autosave loop
    snapshot: Arc<RwLock<Option<Vec<u8>>>>,

    /// Set when the snapshot changed since the last save
    dirty: Arc<RwLock<bool>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Autosave loop handle, shared so whichever side observes the
    /// disconnect first aborts it, and only that side does
    autosave: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,

    /// How often to autosave
    save_interval: Duration,

    /// Server URL
    server_url: String,
}

impl EditorClient {
    /// Create a new editor client.
    pub fn new(
        identity: Identity,
        doc_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            identity,
            doc_id: doc_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            snapshot: Arc::new(RwLock::new(None)),
            dirty: Arc::new(RwLock::new(false)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            autosave: Arc::new(Mutex::new(None)),
            save_interval: SAVE_INTERVAL,
            server_url: server_url.into(),
        }
    }

    /// Override the autosave interval. Mostly useful for tests.
    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and request the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// the autosave loop. The server answers with `DocumentLoaded` (or
    /// `LoadFailed`), then presence and remote events flow as they happen.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        match ws_result {
            Ok((ws_stream, _)) => {
                let (ws_writer, mut ws_reader) = futures_util::StreamExt::split(ws_stream);

                // Outgoing message channel
                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                self.outgoing_tx = Some(out_tx);

                // Writer task: forward outgoing channel to WebSocket
                let ws_writer = Arc::new(tokio::sync::Mutex::new(ws_writer));
                let writer = ws_writer.clone();
                tokio::spawn(async move {
                    use futures_util::SinkExt;
                    while let Some(data) = out_rx.recv().await {
                        let mut w = writer.lock().await;
                        if w.send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    // Channel closed by disconnect(): say goodbye so the
                    // server tears the session down promptly
                    let mut w = writer.lock().await;
                    let _ = w
                        .send(tokio_tungstenite::tungstenite::Message::Close(None))
                        .await;
                });

                // Request the document; the server resolves or creates it
                let join_msg = WireMessage::get_document(&self.doc_id, &self.identity)?;
                if let Some(ref tx) = self.outgoing_tx {
                    let _ = tx.send(join_msg.encode()?).await;
                }

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(ClientEvent::Connected).await;

                // Autosave loop: push the snapshot whenever it changed
                let autosave_tx = self
                    .outgoing_tx
                    .clone()
                    .ok_or(ProtocolError::ConnectionClosed)?;
                let snapshot = self.snapshot.clone();
                let dirty = self.dirty.clone();
                let doc_id = self.doc_id.clone();
                let interval = self.save_interval;
                let handle = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    // The first tick fires immediately, skip it
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let mut flag = dirty.write().await;
                        if !*flag {
                            continue;
                        }
                        *flag = false;
                        drop(flag);
                        let content = snapshot.read().await.clone();
                        if let Some(content) = content {
                            let msg = WireMessage::save_document(&doc_id, content);
                            if let Ok(encoded) = msg.encode() {
                                if autosave_tx.send(encoded).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                // A reconnect replaces the previous autosave loop; the old
                // task must not keep ticking against the dead connection
                if let Some(previous) = self.autosave.lock().await.replace(handle) {
                    previous.abort();
                }

                // Reader task: process incoming WebSocket messages
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                let autosave = self.autosave.clone();
                tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                                let bytes: Vec<u8> = data.into();
                                if let Ok(wire_msg) = WireMessage::decode(&bytes) {
                                    let event = match wire_msg.kind {
                                        EventKind::LoadDocument => {
                                            *state.write().await = ConnectionState::Joined;
                                            match wire_msg.document() {
                                                Ok(doc) => Some(ClientEvent::DocumentLoaded {
                                                    content: doc.content,
                                                    title: doc.title,
                                                }),
                                                Err(_) => None,
                                            }
                                        }
                                        EventKind::LoadFailed => wire_msg
                                            .failure_reason()
                                            .ok()
                                            .map(ClientEvent::LoadFailed),
                                        EventKind::ReceiveEdit => Some(ClientEvent::RemoteEdit {
                                            origin: wire_msg.origin,
                                            ops: wire_msg.payload,
                                        }),
                                        EventKind::TitleUpdated => match wire_msg.title() {
                                            Ok(title) => Some(ClientEvent::TitleChanged {
                                                origin: wire_msg.origin,
                                                title,
                                            }),
                                            Err(_) => None,
                                        },
                                        EventKind::Presence => wire_msg
                                            .presence_list()
                                            .ok()
                                            .map(ClientEvent::Presence),
                                        EventKind::ReceiveCursor => {
                                            match wire_msg.cursor_broadcast() {
                                                Ok(cursor) => Some(ClientEvent::RemoteCursor {
                                                    origin: wire_msg.origin,
                                                    identity: cursor.identity,
                                                    range: cursor.range,
                                                }),
                                                Err(_) => None,
                                            }
                                        }
                                        _ => None,
                                    };

                                    if let Some(evt) = event {
                                        let _ = event_tx.send(evt).await;
                                    }
                                }
                            }
                            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                                break;
                            }
                            _ => {}
                        }
                    }

                    // Connection lost: stop autosaving before reporting it
                    if let Some(handle) = autosave.lock().await.take() {
                        handle.abort();
                    }
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(ClientEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Tear the connection down locally.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.autosave.lock().await.take() {
            handle.abort();
        }
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.send(ClientEvent::Disconnected).await;
    }

    /// Relay local edit operations, verbatim bytes, to the room.
    pub async fn send_edit(&self, ops: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = WireMessage::edit_ops(&self.doc_id, ops);
        self.send(msg.encode()?).await
    }

    /// Rename the document for everyone in the room.
    pub async fn update_title(&self, title: &str) -> Result<(), ProtocolError> {
        let msg = WireMessage::update_title(&self.doc_id, title)?;
        self.send(msg.encode()?).await
    }

    /// Broadcast our cursor position to the room.
    ///
    /// Dropped silently when not connected, a stale cursor is not worth an
    /// error to the caller.
    pub async fn send_cursor(&self, range: CursorRange) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Joined {
            return Ok(());
        }
        let msg = WireMessage::cursor_move(&self.doc_id, range)?;
        self.send(msg.encode()?).await
    }

    /// Replace the snapshot the autosave loop will persist next.
    ///
    /// Call this whenever the editor contents change. The bytes are the full
    /// document in the editor's own format; nothing here inspects them.
    pub async fn update_snapshot(&self, content: Vec<u8>) {
        *self.snapshot.write().await = Some(content);
        *self.dirty.write().await = true;
    }

    /// Force an immediate save, outside the autosave cadence.
    pub async fn save_now(&self) -> Result<(), ProtocolError> {
        let content = self.snapshot.read().await.clone();
        if let Some(content) = content {
            *self.dirty.write().await = false;
            let msg = WireMessage::save_document(&self.doc_id, content);
            self.send(msg.encode()?).await?;
        }
        Ok(())
    }

    async fn send(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Our identity in the room.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// The configured autosave interval.
    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let identity = Identity::new("u1", "TestUser");
        let client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        assert_eq!(client.identity().name, "TestUser");
        assert_eq!(client.doc_id(), "doc1");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.save_interval(), SAVE_INTERVAL);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let identity = Identity::new("u1", "TestUser");
        let client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        assert_eq!(
            client.connection_state().await,
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_save_interval_override() {
        let identity = Identity::new("u1", "TestUser");
        let client = EditorClient::new(identity, "doc1", "ws://localhost:9090")
            .with_save_interval(Duration::from_millis(50));
        assert_eq!(client.save_interval(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_send_edit_disconnected_errors() {
        let identity = Identity::new("u1", "TestUser");
        let client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        let result = client.send_edit(vec![1, 2, 3]).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_send_cursor_disconnected_noop() {
        let identity = Identity::new("u1", "TestUser");
        let client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        // Cursors are best-effort, no error when offline
        client.send_cursor(CursorRange::caret(4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_snapshot_marks_dirty() {
        let identity = Identity::new("u1", "TestUser");
        let client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        client.update_snapshot(b"{\"ops\":[]}".to_vec()).await;
        assert!(*client.dirty.read().await);
        assert!(client.snapshot.read().await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let identity = Identity::new("u1", "TestUser");
        let mut client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_connect_aborts_previous_autosave_task() {
        use futures_util::StreamExt;
        use std::sync::atomic::{AtomicBool, Ordering};

        // Minimal accept-and-drain server so connect() succeeds
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let identity = Identity::new("u1", "TestUser");
        let mut client = EditorClient::new(identity, "doc1", format!("ws://{addr}"));

        // Plant a stand-in for a leftover autosave loop; dropping its guard
        // proves the task actually ended
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let ended = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(ended.clone());
        let leftover = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        *client.autosave.lock().await = Some(leftover);

        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(ended.load(Ordering::SeqCst), "Previous autosave loop still alive");
        assert!(client.autosave.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let identity = Identity::new("u1", "TestUser");
        let mut client = EditorClient::new(identity, "doc1", "ws://localhost:9090");

        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Joined);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
    }
}
