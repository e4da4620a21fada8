//! Fan-out broadcast to room members over tokio broadcast channels.
//!
//! Each document room owns one channel; every connection in the room holds an
//! independent receiver buffering up to `capacity` frames. Frames carry the
//! origin connection id, and each connection's outbound loop drops frames it
//! originated — origin exclusion happens at the receiver, not here.
//!
//! Delivery is fire-and-forget: a lagging receiver drops frames (logged by
//! its connection task) and a receiver that went away is simply no longer
//! counted. There is no acknowledgment and no ordering repair across
//! origins.
//!
//! This layer deliberately tracks no membership. Presence is derived from the
//! session registry; the only room-level fact kept here is the channel itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, WireMessage};

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub frames_sent: u64,
    pub active_receivers: usize,
}

/// A broadcast group for a single document room.
pub struct RoomGroup {
    /// Broadcast channel sender (one per room)
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Frames buffered per receiver before lagging drops begin
    capacity: usize,
    /// Lock-free send counter
    frames_sent: AtomicU64,
}

impl RoomGroup {
    /// Create a group with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe a connection to this room's frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Broadcast a message to every subscriber.
    ///
    /// Returns the number of receivers the frame reached. Zero receivers is
    /// not an error — the last member may have just unsubscribed.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes (fast path, no re-serialization).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of relay statistics.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}

/// Maps document ids to their broadcast groups.
///
/// Groups are created lazily on first join and removed once the last
/// subscriber is gone, so an abandoned room holds no resources.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<RoomGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<RoomGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-check
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            return room.clone();
        }
        let room = Arc::new(RoomGroup::new(self.default_capacity));
        rooms.insert(doc_id.to_string(), room.clone());
        room
    }

    /// Get or create the room and subscribe to it, atomically.
    ///
    /// The receiver is created while the rooms map is write-locked, so
    /// `remove_if_empty` can never reap the group in the window between
    /// handing it out and the subscription existing. Joining connections
    /// must use this instead of `get_or_create` + `subscribe`.
    pub async fn join_room(
        &self,
        doc_id: &str,
    ) -> (Arc<RoomGroup>, broadcast::Receiver<Arc<Vec<u8>>>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(RoomGroup::new(self.default_capacity)))
            .clone();
        let rx = room.subscribe();
        (room, rx)
    }

    /// Look up a room without creating it.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<RoomGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room that has no subscribers left. Returns whether it was removed.
    pub async fn remove_if_empty(&self, doc_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.receiver_count() == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    /// Number of rooms with live channels.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Document ids of all live rooms.
    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
