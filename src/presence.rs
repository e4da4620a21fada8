//! Room presence: who is currently in a document.
//!
//! Presence is purely derived state. Every join and every leave triggers a
//! full recompute from the [`SessionRegistry`] — the list is never patched
//! incrementally, so it cannot drift from actual session state. The caller
//! (the transport layer) broadcasts the result to the whole room.
//!
//! The client half of this module tracks remote peers' cursors: ranges are
//! ephemeral and relay-only, so a cursor exists locally only between the
//! owner's last move event and the next presence list that no longer names
//! the owner.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{CursorRange, Identity};
use crate::registry::SessionRegistry;

/// Derives the presence list of a room from the session registry.
pub struct PresenceTracker {
    registry: Arc<SessionRegistry>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Recompute the deduplicated identity list of a room.
    ///
    /// `excluding` skips one connection; used during the disconnect race,
    /// when the leaving connection may still be registered while the leave
    /// broadcast is being prepared. Identities are deduplicated by user id —
    /// the same user on two connections appears once.
    pub async fn recompute(&self, doc_id: &str, excluding: Option<Uuid>) -> Vec<Identity> {
        let sessions = self.registry.list_by_room(doc_id).await;

        let mut seen = HashSet::new();
        let mut identities = Vec::with_capacity(sessions.len());
        for session in sessions {
            if Some(session.conn_id) == excluding {
                continue;
            }
            if let Some(identity) = session.identity {
                if seen.insert(identity.id.clone()) {
                    identities.push(identity);
                }
            }
        }
        identities
    }
}

/// A remote peer's cursor as last relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub identity: Identity,
    pub range: CursorRange,
}

/// Client-side bookkeeping of remote cursors, keyed by user id.
///
/// Fed by `receive-cursor-move` events and pruned against each incoming
/// presence list. A newly joined client sees no cursor for a peer until that
/// peer's next move event.
#[derive(Debug, Default)]
pub struct RemoteCursorSet {
    cursors: HashMap<String, RemoteCursor>,
}

impl RemoteCursorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a relayed cursor move. Creates or replaces the owner's entry.
    pub fn apply(&mut self, identity: Identity, range: CursorRange) {
        self.cursors
            .insert(identity.id.clone(), RemoteCursor { identity, range });
    }

    /// Drop cursors of users absent from the latest presence list.
    ///
    /// Returns the user ids that were removed (so the UI can tear down
    /// their cursor widgets).
    pub fn sync_presence(&mut self, present: &[Identity]) -> Vec<String> {
        let live: HashSet<&str> = present.iter().map(|i| i.id.as_str()).collect();
        let gone: Vec<String> = self
            .cursors
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &gone {
            self.cursors.remove(id);
        }
        gone
    }

    pub fn cursor(&self, user_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(user_id)
    }

    /// All tracked cursors, unordered.
    pub fn cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn joined(registry: &SessionRegistry, doc: &str, id: &str, name: &str) -> Uuid {
        let conn = Uuid::new_v4();
        registry.on_connect(conn).await;
        registry.begin_join(conn).await.unwrap();
        registry.join(conn, doc, Identity::new(id, name)).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_recompute_empty_room() {
        let registry = Arc::new(SessionRegistry::new());
        let tracker = PresenceTracker::new(registry);
        assert!(tracker.recompute("doc1", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_recompute_lists_joined_identities() {
        let registry = Arc::new(SessionRegistry::new());
        joined(&registry, "doc1", "u1", "Alice").await;
        joined(&registry, "doc1", "u2", "Bob").await;
        joined(&registry, "doc2", "u3", "Carol").await;

        let tracker = PresenceTracker::new(registry);
        let mut names: Vec<String> = tracker
            .recompute("doc1", None)
            .await
            .into_iter()
            .map(|i| i.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_recompute_excludes_leaving_connection() {
        let registry = Arc::new(SessionRegistry::new());
        let leaving = joined(&registry, "doc1", "u1", "Alice").await;
        joined(&registry, "doc1", "u2", "Bob").await;

        let tracker = PresenceTracker::new(registry);
        let list = tracker.recompute("doc1", Some(leaving)).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "Bob");
    }

    #[tokio::test]
    async fn test_recompute_dedupes_same_user_two_connections() {
        let registry = Arc::new(SessionRegistry::new());
        joined(&registry, "doc1", "u1", "Alice").await;
        joined(&registry, "doc1", "u1", "Alice").await; // second tab

        let tracker = PresenceTracker::new(registry);
        assert_eq!(tracker.recompute("doc1", None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_recompute_after_leave_sequence() {
        let registry = Arc::new(SessionRegistry::new());
        let a = joined(&registry, "doc1", "u1", "Alice").await;
        let b = joined(&registry, "doc1", "u2", "Bob").await;
        let c = joined(&registry, "doc1", "u3", "Carol").await;
        let _ = (a, c);

        registry.on_disconnect(b).await;
        let tracker = PresenceTracker::new(registry);
        let list = tracker.recompute("doc1", None).await;
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|i| i.id != "u2"));
    }

    #[test]
    fn test_cursor_set_apply_and_replace() {
        let mut set = RemoteCursorSet::new();
        set.apply(Identity::new("u1", "Alice"), CursorRange::caret(3));
        set.apply(Identity::new("u1", "Alice"), CursorRange::new(5, 2));

        assert_eq!(set.len(), 1);
        assert_eq!(set.cursor("u1").unwrap().range, CursorRange::new(5, 2));
    }

    #[test]
    fn test_cursor_set_pruned_by_presence() {
        let mut set = RemoteCursorSet::new();
        set.apply(Identity::new("u1", "Alice"), CursorRange::caret(0));
        set.apply(Identity::new("u2", "Bob"), CursorRange::caret(9));

        let gone = set.sync_presence(&[Identity::new("u1", "Alice")]);
        assert_eq!(gone, vec!["u2".to_string()]);
        assert_eq!(set.len(), 1);
        assert!(set.cursor("u2").is_none());
    }

    #[test]
    fn test_cursor_set_no_history_for_late_joiner() {
        // A fresh set has nothing until peers move again
        let set = RemoteCursorSet::new();
        assert!(set.is_empty());
        assert!(set.cursor("u1").is_none());
    }
}
