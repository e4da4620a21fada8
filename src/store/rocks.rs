//! RocksDB-backed document store.
//!
//! Column families:
//! - `content` — full rich-text deltas (LZ4 compressed), keyed by document id
//! - `meta`    — bincode metadata (title, created/saved timestamps)
//!
//! Document ids are opaque strings; the id is also the room key upstream.
//! Both writes a document ever receives — `replace_content` and
//! `replace_title` — are last-write-wins overwrites of independent fields,
//! carried out as single atomic write batches.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{DEFAULT_TITLE, EMPTY_PARAGRAPH_DELTA};

const CF_CONTENT: &str = "content";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_CONTENT, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing: small caches, caller-provided temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// Opaque full-document delta, exactly as last saved
    pub content: Vec<u8>,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last content persist timestamp (seconds since epoch)
    pub saved_at: u64,
}

/// Metadata record stored in the `meta` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentMeta {
    title: String,
    created_at: u64,
    saved_at: u64,
}

impl DocumentMeta {
    fn new() -> Self {
        let now = now_secs();
        Self {
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            saved_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document id absent
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the read-miss-create sequence of `resolve_or_create` so
    /// that concurrent first access for one id produces exactly one record.
    create_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            create_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        // Both CFs serve single-document point lookups
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Return the document for `id`, creating it on first access.
    ///
    /// A created document carries the default title and the single
    /// empty-paragraph delta. Never fails with `NotFound`; concurrent
    /// first access for the same id yields one persisted record.
    pub fn resolve_or_create(&self, id: &str) -> Result<Document, StoreError> {
        let _guard = self
            .create_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.get(id) {
            Ok(doc) => Ok(doc),
            Err(StoreError::NotFound(_)) => self.create(id),
            Err(e) => Err(e),
        }
    }

    fn create(&self, id: &str) -> Result<Document, StoreError> {
        let cf_content = self.cf(CF_CONTENT)?;
        let cf_meta = self.cf(CF_META)?;

        let meta = DocumentMeta::new();
        let compressed = lz4_flex::compress_prepend_size(EMPTY_PARAGRAPH_DELTA);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_content, id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(Document {
            id: id.to_string(),
            title: meta.title,
            content: EMPTY_PARAGRAPH_DELTA.to_vec(),
            created_at: meta.created_at,
            saved_at: meta.saved_at,
        })
    }

    /// Overwrite the document's content. Last write wins, no merge.
    ///
    /// Also bumps the saved-at timestamp. Creates the metadata record when
    /// absent so content can never exist without one.
    pub fn replace_content(&self, id: &str, content: &[u8]) -> Result<(), StoreError> {
        let cf_content = self.cf(CF_CONTENT)?;
        let cf_meta = self.cf(CF_META)?;

        let mut meta = self.load_meta(id).unwrap_or_else(|_| DocumentMeta::new());
        meta.saved_at = now_secs();

        let compressed = lz4_flex::compress_prepend_size(content);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_content, id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    /// Overwrite the document's title, independent of content cadence.
    pub fn replace_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let cf_meta = self.cf(CF_META)?;

        let mut meta = self.load_meta(id).unwrap_or_else(|_| DocumentMeta::new());
        meta.title = title.to_string();

        // Same write path as content so the sync policy applies everywhere
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    /// Load a document. `NotFound` when the id has never been seen.
    pub fn get(&self, id: &str) -> Result<Document, StoreError> {
        let cf_content = self.cf(CF_CONTENT)?;
        let meta = self.load_meta(id)?;

        let compressed = self
            .db
            .get_cf(&cf_content, id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let content = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;

        Ok(Document {
            id: id.to_string(),
            title: meta.title,
            content,
            created_at: meta.created_at,
            saved_at: meta.saved_at,
        })
    }

    /// Whether a document exists.
    pub fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let cf_meta = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf_meta, id.as_bytes())?.is_some())
    }

    /// Ids of all stored documents.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf_meta = self.cf(CF_META)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(&cf_meta, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if let Ok(id) = std::str::from_utf8(&key) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn load_meta(&self, id: &str) -> Result<DocumentMeta, StoreError> {
        let cf_meta = self.cf(CF_META)?;
        match self.db.get_cf(&cf_meta, id.as_bytes())? {
            Some(bytes) => DocumentMeta::decode(&bytes),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// CPU core count for RocksDB background parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_temp() -> (DocumentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (store, dir)
    }

    #[test]
    fn test_resolve_or_create_defaults() {
        let (store, _dir) = open_temp();

        let doc = store.resolve_or_create("doc1").unwrap();
        assert_eq!(doc.id, "doc1");
        assert_eq!(doc.title, DEFAULT_TITLE);
        assert_eq!(doc.content, EMPTY_PARAGRAPH_DELTA);
        assert!(doc.created_at > 0);
    }

    #[test]
    fn test_resolve_or_create_returns_existing() {
        let (store, _dir) = open_temp();

        store.resolve_or_create("doc1").unwrap();
        store.replace_content("doc1", b"edited").unwrap();

        // Second resolve sees the edits, not a fresh default
        let doc = store.resolve_or_create("doc1").unwrap();
        assert_eq!(doc.content, b"edited");
    }

    #[test]
    fn test_concurrent_first_access_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.resolve_or_create("racing-doc").unwrap())
            })
            .collect();

        let mut created_ats = Vec::new();
        for handle in handles {
            let doc = handle.join().unwrap();
            // Every caller observes the invariant default content
            assert_eq!(doc.content, EMPTY_PARAGRAPH_DELTA);
            created_ats.push(doc.created_at);
        }
        // One record: everyone saw the same creation time
        assert!(created_ats.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.list_documents().unwrap(), vec!["racing-doc"]);
    }

    #[test]
    fn test_replace_content_last_write_wins() {
        let (store, _dir) = open_temp();
        store.resolve_or_create("doc1").unwrap();

        store.replace_content("doc1", b"first").unwrap();
        store.replace_content("doc1", b"second").unwrap();

        // Exactly the last write, never a blend
        assert_eq!(store.get("doc1").unwrap().content, b"second");
    }

    #[test]
    fn test_replace_content_bumps_saved_at() {
        let (store, _dir) = open_temp();
        let created = store.resolve_or_create("doc1").unwrap();
        store.replace_content("doc1", b"snapshot").unwrap();

        let doc = store.get("doc1").unwrap();
        assert!(doc.saved_at >= created.saved_at);
        assert_eq!(doc.created_at, created.created_at);
    }

    #[test]
    fn test_replace_title_independent_of_content() {
        let (store, _dir) = open_temp();
        store.resolve_or_create("doc1").unwrap();
        store.replace_content("doc1", b"body").unwrap();

        store.replace_title("doc1", "Design notes").unwrap();

        let doc = store.get("doc1").unwrap();
        assert_eq!(doc.title, "Design notes");
        assert_eq!(doc.content, b"body");
    }

    #[test]
    fn test_all_writes_honor_sync_policy() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            sync_writes: true,
            ..StoreConfig::for_testing(dir.path().join("db"))
        };
        let store = DocumentStore::open(config).unwrap();

        // Every persistence operation goes through the synced write path
        store.resolve_or_create("doc1").unwrap();
        store.replace_content("doc1", b"body").unwrap();
        store.replace_title("doc1", "Synced").unwrap();

        let doc = store.get("doc1").unwrap();
        assert_eq!(doc.title, "Synced");
        assert_eq!(doc.content, b"body");
    }

    #[test]
    fn test_get_not_found() {
        let (store, _dir) = open_temp();
        match store.get("never-seen") {
            Err(StoreError::NotFound(id)) => assert_eq!(id, "never-seen"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_exists_and_list() {
        let (store, _dir) = open_temp();
        assert!(!store.exists("doc1").unwrap());

        store.resolve_or_create("doc1").unwrap();
        store.resolve_or_create("doc2").unwrap();

        assert!(store.exists("doc1").unwrap());
        let mut ids = store.list_documents().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["doc1", "doc2"]);
    }

    #[test]
    fn test_content_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        {
            let store = DocumentStore::open(config.clone()).unwrap();
            store.resolve_or_create("doc1").unwrap();
            store.replace_content("doc1", b"persisted body").unwrap();
            store.replace_title("doc1", "Kept").unwrap();
        }

        let store = DocumentStore::open(config).unwrap();
        let doc = store.get("doc1").unwrap();
        assert_eq!(doc.content, b"persisted body");
        assert_eq!(doc.title, "Kept");
    }

    #[test]
    fn test_large_content_roundtrip() {
        let (store, _dir) = open_temp();
        store.resolve_or_create("doc1").unwrap();

        // 1MB of repetitive delta-ish JSON compresses well and must roundtrip
        let big: Vec<u8> = br#"{"ops":[{"insert":"lorem ipsum "}]}"#
            .iter()
            .cycle()
            .take(1_000_000)
            .copied()
            .collect();
        store.replace_content("doc1", &big).unwrap();
        assert_eq!(store.get("doc1").unwrap().content, big);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("doc1".into());
        assert!(err.to_string().contains("not found"));
        let err = StoreError::DatabaseError("boom".into());
        assert!(err.to_string().contains("Database error"));
    }
}
