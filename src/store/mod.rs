//! Durable document persistence.
//!
//! ```text
//! ┌─────────────┐  replace_content / replace_title  ┌──────────────┐
//! │ RelayServer │ ────────────────────────────────► │ DocumentStore│
//! │ (stateless) │ ◄──────────────────────────────── │ (RocksDB)    │
//! └─────────────┘        resolve_or_create          └──────┬───────┘
//!                                                          │
//!                                       ┌──────────────────┴─────────┐
//!                                       │ CF "content" — LZ4 deltas  │
//!                                       │ CF "meta"    — title/times │
//!                                       └────────────────────────────┘
//! ```
//!
//! Content is the client's full rich-text delta, stored verbatim (compressed)
//! and never interpreted. All writes are last-write-wins single batches; there
//! is no read-modify-write cycle, so no locking beyond the atomicity of one
//! batch — except document creation, which is serialized so that concurrent
//! first access yields exactly one record.

pub mod rocks;

pub use rocks::{Document, DocumentStore, StoreConfig, StoreError};

/// Title given to a document created on first access.
pub const DEFAULT_TITLE: &str = "Untitled Document";

/// The single empty-paragraph delta every new document starts with.
/// Content is never empty or missing.
pub const EMPTY_PARAGRAPH_DELTA: &[u8] = br#"{"ops":[{"insert":"\n"}]}"#;
