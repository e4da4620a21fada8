//! WebSocket relay server with room-based document routing.
//!
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── RoomGroup (fan-out)
//! Client B ──┘         │
//!                      ├── SessionRegistry ─▶ PresenceTracker
//!                      └── DocumentStore (RocksDB)
//! ```
//!
//! The server never interprets edit operations: deltas are relayed verbatim
//! to every other member of the room and the latest client-pushed snapshot is
//! persisted as-is. Edits from different origins may reach third peers in
//! either relative order — the transport only guarantees per-connection
//! ordering, and there is no cross-origin repair. Conflict convergence is the
//! editor's job on each client.
//!
//! Availability beats durability here: a failing store write degrades only
//! autosave, never the live session, so persistence errors are logged and
//! swallowed at every relay call site.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{RoomGroup, RoomManager};
use crate::presence::PresenceTracker;
use crate::protocol::{EventKind, Identity, WireMessage};
use crate::registry::{RegistryError, SessionRegistry};
use crate::store::{DocumentStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Document store configuration
    pub storage: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage: StoreConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub autosave_writes: u64,
    pub autosave_failures: u64,
    pub title_updates: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    presence: Arc<PresenceTracker>,
    rooms: Arc<RoomManager>,
    store: Arc<DocumentStore>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a server, opening the document store at the configured path.
    pub fn new(config: ServerConfig) -> Result<Self, crate::store::StoreError> {
        let registry = Arc::new(SessionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(registry.clone()));
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let store = Arc::new(DocumentStore::open(config.storage.clone())?);

        Ok(Self {
            config,
            registry,
            presence,
            rooms,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Create with storage at the given path and defaults otherwise.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<std::path::PathBuf>,
    ) -> Result<Self, crate::store::StoreError> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage: StoreConfig {
                path: path.into(),
                ..StoreConfig::default()
            },
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Start accepting WebSocket connections. Runs the accept loop forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let presence = self.presence.clone();
            let rooms = self.rooms.clone();
            let store = self.store.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, presence, rooms, store, stats)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection through its whole lifecycle:
    /// `Connected → AwaitingDocument → Joined → Disconnected`.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        presence: Arc<PresenceTracker>,
        rooms: Arc<RoomManager>,
        store: Arc<DocumentStore>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        registry.on_connect(conn_id).await;
        log::info!("Connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection room context, set once on a successful join
        let mut joined_doc: Option<String> = None;
        let mut identity: Option<Identity> = None;
        let mut room: Option<Arc<RoomGroup>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Inbound WebSocket frame
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let msg = match WireMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {conn_id}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match msg.kind {
                                EventKind::GetDocument => {
                                    // Join with no document id: ignored, no state change
                                    if msg.doc_id.is_empty() {
                                        log::warn!("Join without document id from {conn_id}, ignoring");
                                        continue;
                                    }
                                    match registry.begin_join(conn_id).await {
                                        Ok(()) => {}
                                        Err(RegistryError::AlreadyJoined(_)) => {
                                            // Rejoining on a live connection is forbidden
                                            log::warn!(
                                                "Connection {conn_id} requested {} while already in a room, ignoring",
                                                msg.doc_id
                                            );
                                            continue;
                                        }
                                        Err(e) => {
                                            log::error!("Registry error for {conn_id}: {e}");
                                            continue;
                                        }
                                    }

                                    let ident = match msg.identity() {
                                        Ok(ident) => ident,
                                        Err(e) => {
                                            registry.abort_join(conn_id).await;
                                            log::warn!("Malformed join payload from {conn_id}: {e}");
                                            continue;
                                        }
                                    };

                                    match store.resolve_or_create(&msg.doc_id) {
                                        Ok(doc) => {
                                            if let Err(e) =
                                                registry.join(conn_id, &msg.doc_id, ident.clone()).await
                                            {
                                                log::error!("Join failed for {conn_id}: {e}");
                                                continue;
                                            }

                                            // Atomic lookup-and-subscribe: a concurrent
                                            // leaver's cleanup cannot reap the group before
                                            // this receiver exists. Subscribing before the
                                            // presence broadcast also means the requester
                                            // receives its own join's presence frame.
                                            let (group, rx) = rooms.join_room(&msg.doc_id).await;
                                            broadcast_rx = Some(rx);

                                            // Snapshot goes to the requester only
                                            let load = WireMessage::load_document(
                                                &msg.doc_id,
                                                doc.content,
                                                doc.title,
                                            );
                                            match load.and_then(|m| m.encode()) {
                                                Ok(encoded) => {
                                                    if ws_sender
                                                        .send(Message::Binary(encoded.into()))
                                                        .await
                                                        .is_err()
                                                    {
                                                        break;
                                                    }
                                                }
                                                Err(e) => {
                                                    log::error!(
                                                        "Failed to encode snapshot for {}: {e}",
                                                        msg.doc_id
                                                    );
                                                    break;
                                                }
                                            }

                                            let list = presence.recompute(&msg.doc_id, None).await;
                                            if let Ok(frame) =
                                                WireMessage::presence(&msg.doc_id, &list)
                                            {
                                                let _ = group.broadcast(&frame);
                                            }

                                            let active_rooms = rooms.room_count().await;
                                            stats.write().await.active_rooms = active_rooms;

                                            log::info!(
                                                "{} ({}) joined document {} ({} present)",
                                                ident.name,
                                                conn_id,
                                                msg.doc_id,
                                                list.len()
                                            );

                                            joined_doc = Some(msg.doc_id.clone());
                                            identity = Some(ident);
                                            room = Some(group);
                                        }
                                        Err(e) => {
                                            // Fatal to this request only; report to the
                                            // requester, never broadcast
                                            registry.abort_join(conn_id).await;
                                            log::error!(
                                                "Failed to resolve document {} for {conn_id}: {e}",
                                                msg.doc_id
                                            );
                                            let fail =
                                                WireMessage::load_failed(&msg.doc_id, &e.to_string());
                                            if let Ok(encoded) = fail.and_then(|m| m.encode()) {
                                                if ws_sender
                                                    .send(Message::Binary(encoded.into()))
                                                    .await
                                                    .is_err()
                                                {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                }

                                EventKind::EditOps => {
                                    // Relay verbatim to the room, origin-filtered at receivers.
                                    // Fire-and-forget: no validation, no persistence here.
                                    if let (Some(doc), Some(group)) = (&joined_doc, &room) {
                                        let relay =
                                            WireMessage::receive_edit(conn_id, doc.clone(), msg.payload);
                                        let _ = group.broadcast(&relay);
                                    } else {
                                        log::debug!("Edit from {conn_id} before join, dropped");
                                    }
                                }

                                EventKind::UpdateTitle => {
                                    if let (Some(doc), Some(group)) = (&joined_doc, &room) {
                                        let title = match msg.title() {
                                            Ok(title) => title,
                                            Err(e) => {
                                                log::warn!("Malformed title from {conn_id}: {e}");
                                                continue;
                                            }
                                        };
                                        // Titles persist immediately, unlike content
                                        if let Err(e) = store.replace_title(doc, &title) {
                                            log::error!("Failed to persist title for {doc}: {e}");
                                        } else {
                                            stats.write().await.title_updates += 1;
                                        }
                                        if let Ok(relay) =
                                            WireMessage::title_updated(conn_id, doc.clone(), &title)
                                        {
                                            let _ = group.broadcast(&relay);
                                        }
                                    }
                                }

                                EventKind::SaveDocument => {
                                    // Autosave sink: overwrite with the client's snapshot.
                                    // Errors never reach the session.
                                    if let Some(doc) = &joined_doc {
                                        match store.replace_content(doc, &msg.payload) {
                                            Ok(()) => stats.write().await.autosave_writes += 1,
                                            Err(e) => {
                                                log::error!("Failed to persist content for {doc}: {e}");
                                                stats.write().await.autosave_failures += 1;
                                            }
                                        }
                                    }
                                }

                                EventKind::CursorMove => {
                                    if let (Some(doc), Some(group), Some(ident)) =
                                        (&joined_doc, &room, &identity)
                                    {
                                        let range = match msg.cursor_range() {
                                            Ok(range) => range,
                                            Err(e) => {
                                                log::warn!("Malformed cursor from {conn_id}: {e}");
                                                continue;
                                            }
                                        };
                                        if let Ok(relay) = WireMessage::receive_cursor(
                                            conn_id,
                                            doc.clone(),
                                            range,
                                            ident.clone(),
                                        ) {
                                            let _ = group.broadcast(&relay);
                                        }
                                    }
                                }

                                // Server-to-client kinds arriving from a client
                                other => {
                                    log::debug!("Unexpected {other:?} frame from {conn_id}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {conn_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outbound room frame
                frame = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not in a room yet — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(data) => {
                            // Origin exclusion: never echo a frame back to its sender
                            if let Ok(msg) = WireMessage::decode(&data) {
                                if msg.origin == conn_id {
                                    continue;
                                }
                            }
                            if ws_sender
                                .send(Message::Binary(data.to_vec().into()))
                                .await
                                .is_err()
                            {
                                // Peer went away mid-delivery: drop, don't retry
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Teardown: remove the session, then rebroadcast presence without it
        let vacated = registry.on_disconnect(conn_id).await;
        drop(broadcast_rx);

        if let Some(doc) = vacated {
            let list = presence.recompute(&doc, Some(conn_id)).await;
            if let Some(group) = rooms.get(&doc).await {
                if let Ok(frame) = WireMessage::presence(&doc, &list) {
                    let _ = group.broadcast(&frame);
                }
            }
            if rooms.remove_if_empty(&doc).await {
                log::info!("Room {doc} removed (empty)");
            }
        }

        let active_rooms = rooms.room_count().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = active_rooms;
        }
        log::info!("Connection {conn_id} torn down");

        Ok(())
    }

    /// Server statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The room manager.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// The document store.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_server(bind: &str) -> (RelayServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: bind.to_string(),
            broadcast_capacity: 64,
            storage: StoreConfig::for_testing(dir.path().join("db")),
        };
        (RelayServer::new(config).unwrap(), dir)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let (server, _dir) = temp_server("127.0.0.1:0");
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let (server, _dir) = temp_server("127.0.0.1:0");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.autosave_writes, 0);
    }

    #[tokio::test]
    async fn test_server_store_accessible() {
        let (server, _dir) = temp_server("127.0.0.1:0");
        let doc = server.store().resolve_or_create("doc1").unwrap();
        assert_eq!(doc.title, crate::store::DEFAULT_TITLE);
    }
}
