//! # scribe-collab — Real-time collaborative document editing core
//!
//! A WebSocket relay for multi-user rich-text editing. The server treats
//! edit operations as opaque bytes: it relays them verbatim between room
//! members and persists the latest client-pushed snapshot, leaving conflict
//! convergence entirely to the editor on each client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ EditorClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)   │     Binary Proto    │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                          ┌─────────┴─────────┐
//! ┌──────────────┐                  │                   │
//! │ Editor       │           ┌──────┴──────┐    ┌───────┴───────┐
//! │ snapshot     │           │ RoomManager │    │ SessionRegistry│
//! │ (autosaved)  │           │ (fan-out)   │    │ + Presence     │
//! └──────────────┘           └─────────────┘    └───────┬───────┘
//!                                                       │
//!                                               ┌───────┴───────┐
//!                                               │ DocumentStore │
//!                                               │ (RocksDB)     │
//!                                               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`registry`] — Per-connection session lifecycle and room membership
//! - [`presence`] — Membership recomputation and remote cursor tracking
//! - [`broadcast`] — Room-based fan-out
//! - [`store`] — RocksDB document persistence with LZ4 snapshot compression
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket editor client with snapshot autosave

pub mod protocol;
pub mod registry;
pub mod presence;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod store;

// Re-exports for convenience
pub use protocol::{
    CursorBroadcast, CursorRange, DocumentPayload, EventKind, Identity, ProtocolError,
    WireMessage,
};
pub use registry::{RegistryError, Session, SessionRegistry, SessionState};
pub use presence::{PresenceTracker, RemoteCursor, RemoteCursorSet};
pub use broadcast::{RelayStats, RoomGroup, RoomManager};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ClientEvent, ConnectionState, EditorClient, SAVE_INTERVAL};
pub use store::{
    Document, DocumentStore, StoreConfig, StoreError, DEFAULT_TITLE, EMPTY_PARAGRAPH_DELTA,
};
