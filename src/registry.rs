//! Session registry: the single synchronized map from transport connections
//! to the document room and user identity presenting on them.
//!
//! One registry exists per server process. Rooms are not stored anywhere —
//! they are derived views obtained by filtering this registry, so membership
//! cannot drift from session state.
//!
//! Per-connection state machine:
//! ```text
//! Disconnected ─▶ Connected ─▶ AwaitingDocument ─▶ Joined ─▶ Disconnected
//! ```
//! A connection may join at most one room for its lifetime. A second
//! `get-document` on a live connection is rejected, not re-routed.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::Identity;

/// Join-protocol state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport handshake complete, no document context
    Connected,
    /// Document resolution in flight
    AwaitingDocument,
    /// Member of a room, accepting edit/title/cursor/autosave events
    Joined,
}

/// A registered connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: Uuid,
    pub state: SessionState,
    /// Set on join; a session that never requested a document has none
    pub identity: Option<Identity>,
    /// The one room this session belongs to, if joined
    pub doc_id: Option<String>,
}

impl Session {
    fn new(conn_id: Uuid) -> Self {
        Self {
            conn_id,
            state: SessionState::Connected,
            identity: None,
            doc_id: None,
        }
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Operation on a connection the registry has never seen (or already removed)
    UnknownConnection(Uuid),
    /// `get-document` on a connection that already joined a room
    AlreadyJoined(Uuid),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            Self::AlreadyJoined(id) => write!(f, "Connection {id} already joined a room"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Synchronized session map, mutated from every connection-handling task.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a fresh connection with no room.
    pub async fn on_connect(&self, conn_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(conn_id, Session::new(conn_id));
    }

    /// Start the join protocol: `Connected → AwaitingDocument`.
    ///
    /// Rejects connections that already joined (or are mid-join) — rejoining
    /// a second room on a live connection is forbidden in this design.
    pub async fn begin_join(&self, conn_id: Uuid) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;
        match session.state {
            SessionState::Connected => {
                session.state = SessionState::AwaitingDocument;
                Ok(())
            }
            SessionState::AwaitingDocument | SessionState::Joined => {
                Err(RegistryError::AlreadyJoined(conn_id))
            }
        }
    }

    /// Roll back a failed join: `AwaitingDocument → Connected`.
    pub async fn abort_join(&self, conn_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&conn_id) {
            if session.state == SessionState::AwaitingDocument {
                session.state = SessionState::Connected;
            }
        }
    }

    /// Complete the join: bind the room and identity, `AwaitingDocument → Joined`.
    pub async fn join(
        &self,
        conn_id: Uuid,
        doc_id: impl Into<String>,
        identity: Identity,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;
        if session.state == SessionState::Joined {
            return Err(RegistryError::AlreadyJoined(conn_id));
        }
        session.state = SessionState::Joined;
        session.doc_id = Some(doc_id.into());
        session.identity = Some(identity);
        Ok(())
    }

    /// Remove the session and return the room it was in, if any, so the
    /// caller can trigger a presence recompute.
    pub async fn on_disconnect(&self, conn_id: Uuid) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&conn_id).and_then(|s| s.doc_id)
    }

    /// All joined sessions of a room.
    pub async fn list_by_room(&self, doc_id: &str) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| {
                s.state == SessionState::Joined && s.doc_id.as_deref() == Some(doc_id)
            })
            .cloned()
            .collect()
    }

    /// Look up a single session.
    pub async fn session(&self, conn_id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&conn_id).cloned()
    }

    /// Number of live sessions (all states).
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_disconnect() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();

        registry.on_connect(conn).await;
        assert_eq!(registry.len().await, 1);
        let session = registry.session(conn).await.unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert!(session.doc_id.is_none());

        // No room was joined — disconnect returns none
        assert_eq!(registry.on_disconnect(conn).await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_join_lifecycle() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        registry.on_connect(conn).await;

        registry.begin_join(conn).await.unwrap();
        assert_eq!(
            registry.session(conn).await.unwrap().state,
            SessionState::AwaitingDocument
        );

        registry
            .join(conn, "doc1", Identity::new("u1", "Alice"))
            .await
            .unwrap();
        let session = registry.session(conn).await.unwrap();
        assert_eq!(session.state, SessionState::Joined);
        assert_eq!(session.doc_id.as_deref(), Some("doc1"));
        assert_eq!(session.identity.as_ref().unwrap().name, "Alice");

        assert_eq!(registry.on_disconnect(conn).await.as_deref(), Some("doc1"));
    }

    #[tokio::test]
    async fn test_rejoin_rejected() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        registry.on_connect(conn).await;
        registry.begin_join(conn).await.unwrap();
        registry
            .join(conn, "doc1", Identity::new("u1", "Alice"))
            .await
            .unwrap();

        // A second get-document on the same connection is forbidden
        assert_eq!(
            registry.begin_join(conn).await,
            Err(RegistryError::AlreadyJoined(conn))
        );
        // Room binding is unchanged
        assert_eq!(
            registry.session(conn).await.unwrap().doc_id.as_deref(),
            Some("doc1")
        );
    }

    #[tokio::test]
    async fn test_abort_join_rolls_back() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        registry.on_connect(conn).await;
        registry.begin_join(conn).await.unwrap();

        registry.abort_join(conn).await;
        assert_eq!(
            registry.session(conn).await.unwrap().state,
            SessionState::Connected
        );
        // The connection may retry after a rollback
        registry.begin_join(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let registry = SessionRegistry::new();
        let ghost = Uuid::new_v4();
        assert_eq!(
            registry.begin_join(ghost).await,
            Err(RegistryError::UnknownConnection(ghost))
        );
        assert_eq!(
            registry.join(ghost, "doc1", Identity::new("u1", "A")).await,
            Err(RegistryError::UnknownConnection(ghost))
        );
    }

    #[tokio::test]
    async fn test_list_by_room_filters_state_and_room() {
        let registry = SessionRegistry::new();

        let joined = Uuid::new_v4();
        registry.on_connect(joined).await;
        registry.begin_join(joined).await.unwrap();
        registry
            .join(joined, "doc1", Identity::new("u1", "Alice"))
            .await
            .unwrap();

        // Connected but never joined — not a room member
        let idle = Uuid::new_v4();
        registry.on_connect(idle).await;

        // Joined a different room
        let other = Uuid::new_v4();
        registry.on_connect(other).await;
        registry.begin_join(other).await.unwrap();
        registry
            .join(other, "doc2", Identity::new("u2", "Bob"))
            .await
            .unwrap();

        let members = registry.list_by_room("doc1").await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].conn_id, joined);
    }

    #[tokio::test]
    async fn test_concurrent_joins_no_lost_updates() {
        let registry = std::sync::Arc::new(SessionRegistry::new());

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let conn = Uuid::new_v4();
                registry.on_connect(conn).await;
                registry.begin_join(conn).await.unwrap();
                registry
                    .join(conn, "doc1", Identity::new(format!("u{i}"), format!("User {i}")))
                    .await
                    .unwrap();
                conn
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.list_by_room("doc1").await.len(), 32);
    }
}
