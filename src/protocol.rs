//! Binary wire protocol for the collaboration relay.
//!
//! Every WebSocket frame carries one bincode-encoded [`WireMessage`]:
//! ```text
//! ┌──────────┬───────────┬───────────────┬──────────┐
//! │ kind     │ origin    │ doc_id        │ payload  │
//! │ 1 byte   │ 16 bytes  │ len-prefixed  │ variable │
//! └──────────┴───────────┴───────────────┴──────────┘
//! ```
//!
//! Edit operations and document snapshots are opaque to this layer: they are
//! rich-text deltas produced by the editor (JSON in the reference client) and
//! travel as raw bytes inside `payload`, never re-encoded. Structured payloads
//! (identity, title, presence list, cursor) are bincode inside `payload`.
//!
//! `origin` is the connection id of the sender. Clients send `Uuid::nil()`;
//! the server stamps the real connection id before fan-out so that each
//! connection's outbound loop can drop its own messages. Presence frames keep
//! a nil origin — they are addressed to the whole room, sender included.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kinds, one per transport event of the collaboration core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Client requests a document (resolve-or-create + join)
    GetDocument = 1,
    /// Client sends an incremental edit delta
    EditOps = 2,
    /// Client sets a new document title
    UpdateTitle = 3,
    /// Client pushes its full-document snapshot (autosave)
    SaveDocument = 4,
    /// Client reports a cursor move
    CursorMove = 5,
    /// Server delivers the document snapshot to the requester
    LoadDocument = 6,
    /// Server relays an edit delta from a peer
    ReceiveEdit = 7,
    /// Server relays a title change from a peer
    TitleUpdated = 8,
    /// Server broadcasts the room's presence list
    Presence = 9,
    /// Server relays a peer's cursor move
    ReceiveCursor = 10,
    /// Server reports a failed document load to the requester only
    LoadFailed = 11,
}

/// User identity as presented by the (external) identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A Quill-style cursor range: character offset + selection length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub index: u32,
    pub length: u32,
}

impl CursorRange {
    pub fn new(index: u32, length: u32) -> Self {
        Self { index, length }
    }

    /// A collapsed cursor (no selection) at the given offset.
    pub fn caret(index: u32) -> Self {
        Self { index, length: 0 }
    }
}

/// Payload of a `LoadDocument` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentPayload {
    /// Opaque full-document delta
    pub content: Vec<u8>,
    pub title: String,
}

/// Payload of a `ReceiveCursor` frame: the moved range plus its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorBroadcast {
    pub range: CursorRange,
    pub identity: Identity,
}

/// Top-level wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: EventKind,
    /// Originating connection id; nil for client-sent and presence frames
    pub origin: Uuid,
    /// Document (room) identifier; empty for frames outside any room
    pub doc_id: String,
    /// Kind-specific payload
    pub payload: Vec<u8>,
}

impl WireMessage {
    fn structured<T: Serialize>(
        kind: EventKind,
        origin: Uuid,
        doc_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind,
            origin,
            doc_id: doc_id.into(),
            payload,
        })
    }

    /// Client → server: request a document and join its room.
    pub fn get_document(
        doc_id: impl Into<String>,
        identity: &Identity,
    ) -> Result<Self, ProtocolError> {
        Self::structured(EventKind::GetDocument, Uuid::nil(), doc_id, identity)
    }

    /// Client → server: incremental edit. `ops` are opaque delta bytes.
    pub fn edit_ops(doc_id: impl Into<String>, ops: Vec<u8>) -> Self {
        Self {
            kind: EventKind::EditOps,
            origin: Uuid::nil(),
            doc_id: doc_id.into(),
            payload: ops,
        }
    }

    /// Client → server: title change (persisted immediately).
    pub fn update_title(
        doc_id: impl Into<String>,
        title: &str,
    ) -> Result<Self, ProtocolError> {
        Self::structured(EventKind::UpdateTitle, Uuid::nil(), doc_id, &title)
    }

    /// Client → server: full-document snapshot for autosave.
    pub fn save_document(doc_id: impl Into<String>, snapshot: Vec<u8>) -> Self {
        Self {
            kind: EventKind::SaveDocument,
            origin: Uuid::nil(),
            doc_id: doc_id.into(),
            payload: snapshot,
        }
    }

    /// Client → server: cursor move.
    pub fn cursor_move(
        doc_id: impl Into<String>,
        range: CursorRange,
    ) -> Result<Self, ProtocolError> {
        Self::structured(EventKind::CursorMove, Uuid::nil(), doc_id, &range)
    }

    /// Server → requester: the resolved document snapshot.
    pub fn load_document(
        doc_id: impl Into<String>,
        content: Vec<u8>,
        title: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let payload = DocumentPayload {
            content,
            title: title.into(),
        };
        Self::structured(EventKind::LoadDocument, Uuid::nil(), doc_id, &payload)
    }

    /// Server → room: relayed edit delta, stamped with its origin.
    pub fn receive_edit(origin: Uuid, doc_id: impl Into<String>, ops: Vec<u8>) -> Self {
        Self {
            kind: EventKind::ReceiveEdit,
            origin,
            doc_id: doc_id.into(),
            payload: ops,
        }
    }

    /// Server → room: relayed title change, stamped with its origin.
    pub fn title_updated(
        origin: Uuid,
        doc_id: impl Into<String>,
        title: &str,
    ) -> Result<Self, ProtocolError> {
        Self::structured(EventKind::TitleUpdated, origin, doc_id, &title)
    }

    /// Server → room: full presence list (nil origin — everyone receives it).
    pub fn presence(
        doc_id: impl Into<String>,
        identities: &[Identity],
    ) -> Result<Self, ProtocolError> {
        Self::structured(EventKind::Presence, Uuid::nil(), doc_id, &identities)
    }

    /// Server → room: relayed cursor move with its owner's identity.
    pub fn receive_cursor(
        origin: Uuid,
        doc_id: impl Into<String>,
        range: CursorRange,
        identity: Identity,
    ) -> Result<Self, ProtocolError> {
        let payload = CursorBroadcast { range, identity };
        Self::structured(EventKind::ReceiveCursor, origin, doc_id, &payload)
    }

    /// Server → requester: document resolution failed.
    pub fn load_failed(
        doc_id: impl Into<String>,
        reason: &str,
    ) -> Result<Self, ProtocolError> {
        Self::structured(EventKind::LoadFailed, Uuid::nil(), doc_id, &reason)
    }

    /// Re-stamp the origin connection id (server side, before fan-out).
    pub fn with_origin(mut self, origin: Uuid) -> Self {
        self.origin = origin;
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: for<'de> Deserialize<'de>>(
        &self,
        expected: EventKind,
    ) -> Result<T, ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::InvalidEventKind);
        }
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Parse a `GetDocument` payload.
    pub fn identity(&self) -> Result<Identity, ProtocolError> {
        self.parse(EventKind::GetDocument)
    }

    /// Parse an `UpdateTitle` or `TitleUpdated` payload.
    pub fn title(&self) -> Result<String, ProtocolError> {
        match self.kind {
            EventKind::UpdateTitle | EventKind::TitleUpdated => {
                let (title, _) = bincode::serde::decode_from_slice(
                    &self.payload,
                    bincode::config::standard(),
                )
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                Ok(title)
            }
            _ => Err(ProtocolError::InvalidEventKind),
        }
    }

    /// Parse a `CursorMove` payload.
    pub fn cursor_range(&self) -> Result<CursorRange, ProtocolError> {
        self.parse(EventKind::CursorMove)
    }

    /// Parse a `LoadDocument` payload.
    pub fn document(&self) -> Result<DocumentPayload, ProtocolError> {
        self.parse(EventKind::LoadDocument)
    }

    /// Parse a `Presence` payload.
    pub fn presence_list(&self) -> Result<Vec<Identity>, ProtocolError> {
        self.parse(EventKind::Presence)
    }

    /// Parse a `ReceiveCursor` payload.
    pub fn cursor_broadcast(&self) -> Result<CursorBroadcast, ProtocolError> {
        self.parse(EventKind::ReceiveCursor)
    }

    /// Parse a `LoadFailed` payload.
    pub fn failure_reason(&self) -> Result<String, ProtocolError> {
        self.parse(EventKind::LoadFailed)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidEventKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidEventKind => write!(f, "Invalid event kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
