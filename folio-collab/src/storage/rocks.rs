//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: page records (bincode), keyed by doc_id
//! - `updates`  : delta log, keyed by `doc_id:sequence` (LZ4 compressed delta)
//! - `snapshots`: merged states, keyed by `doc_id:version` (LZ4 compressed state)
//! - `blocks`   : search blocks, keyed by `doc_id:ordinal`
//! - `meta`     : last assigned update sequence number, plus per-page
//!   `doc_id:snapshot` and `doc_id:indexed` versions
//!
//! All keys under a document share its 16-byte UUID prefix, so a page's log,
//! snapshots and blocks are each one forward prefix scan, and a cascade delete
//! is one write batch over the same prefixes.

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, ReadOptions, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::model::{ContentBlock, DocumentRecord, SnapshotRecord, UpdateRecord};
use super::{Repository, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_BLOCKS: &str = "blocks";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_SNAPSHOTS, CF_BLOCKS, CF_META];

const META_UPDATE_SEQ: &[u8] = b"update_seq";
const META_SNAPSHOT_VERSION: &[u8] = b"snapshot";
const META_INDEXED_VERSION: &[u8] = b"indexed";

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches).
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

#[derive(Serialize, Deserialize)]
struct StoredUpdate {
    author: String,
    created_at: DateTime<Utc>,
    /// LZ4 with prepended size
    delta: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    created_at: DateTime<Utc>,
    /// LZ4 with prepended size
    state: Vec<u8>,
}

/// RocksDB-backed implementation of [`Repository`].
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes mutations and holds the next update sequence number.
    writes: Mutex<u64>,
}

impl DocumentStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_update_id = Self::recover_sequence(&db)? + 1;
        log::debug!(
            "Opened document store at {} (next update id {next_update_id})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            writes: Mutex::new(next_update_id),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_BLOCKS => {
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                // Payloads are already LZ4 compressed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    /// Last update sequence number assigned before the store was closed.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(cf, META_UPDATE_SEQ)? {
            Some(bytes) => read_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// All `(key, value)` pairs under a document's prefix, in key order.
    fn scan_prefix(&self, cf_name: &str, doc_id: Uuid) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = doc_id.as_bytes();
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn require_document(&self, id: Uuid) -> Result<DocumentRecord, StoreError> {
        self.get_document(id)?.ok_or(StoreError::NotFound(id))
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, u64> {
        // The guarded value is only replaced after a successful write, so a
        // poisoned lock still holds a consistent sequence number.
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta_version(&self, doc_id: Uuid, suffix: &[u8]) -> Result<u64, StoreError> {
        match self.db.get_cf(self.cf(CF_META)?, keyed(doc_id, suffix))? {
            Some(bytes) => read_u64(&bytes),
            None => Ok(0),
        }
    }

    fn decode_snapshot(document_id: Uuid, key: &[u8], value: &[u8]) -> Result<SnapshotRecord, StoreError> {
        let stored: StoredSnapshot = decode(value)?;
        Ok(SnapshotRecord {
            document_id,
            version: read_u64(&key[16..])?,
            state: decompress(&stored.state)?,
            created_at: stored.created_at,
        })
    }
}

impl Repository for DocumentStore {
    fn put_document(&self, doc: &DocumentRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let _guard = self.lock_writes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, doc.id.as_bytes(), encode(doc)?);
        self.write(batch)
    }

    fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn delete_document(&self, id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_META)?;
        let _guard = self.lock_writes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, id.as_bytes());
        batch.delete_cf(cf_meta, keyed(id, META_SNAPSHOT_VERSION));
        batch.delete_cf(cf_meta, keyed(id, META_INDEXED_VERSION));
        for cf_name in [CF_UPDATES, CF_SNAPSHOTS, CF_BLOCKS] {
            let cf = self.cf(cf_name)?;
            for (key, _) in self.scan_prefix(cf_name, id)? {
                batch.delete_cf(cf, &key);
            }
        }
        self.write(batch)?;
        log::info!("Deleted document {id} with its updates, snapshots and blocks");
        Ok(())
    }

    fn documents_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let doc: DocumentRecord = decode(&value)?;
            if doc.updated_at >= since {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn documents_pending_index(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let doc: DocumentRecord = decode(&value)?;
            if self.meta_version(doc.id, META_SNAPSHOT_VERSION)? > self.meta_version(doc.id, META_INDEXED_VERSION)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn indexed_version(&self, document_id: Uuid) -> Result<Option<u64>, StoreError> {
        match self.meta_version(document_id, META_INDEXED_VERSION)? {
            0 => Ok(None),
            version => Ok(Some(version)),
        }
    }

    fn append_update(&self, document_id: Uuid, author: &str, delta: &[u8]) -> Result<UpdateRecord, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut next_id = self.lock_writes();
        let mut doc = self.require_document(document_id)?;
        let id = *next_id;
        let now = Utc::now();
        doc.updated_at = now;

        let stored = StoredUpdate {
            author: author.to_string(),
            created_at: now,
            delta: lz4_flex::compress_prepend_size(delta),
        };

        // Log entry, sequence and page timestamp land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, keyed(document_id, &id.to_be_bytes()), encode(&stored)?);
        batch.put_cf(cf_meta, META_UPDATE_SEQ, id.to_be_bytes());
        batch.put_cf(cf_docs, document_id.as_bytes(), encode(&doc)?);
        self.write(batch)?;
        *next_id = id + 1;

        Ok(UpdateRecord {
            id,
            document_id,
            delta: delta.to_vec(),
            author: stored.author,
            created_at: now,
        })
    }

    fn list_updates(&self, document_id: Uuid) -> Result<Vec<UpdateRecord>, StoreError> {
        self.scan_prefix(CF_UPDATES, document_id)?
            .into_iter()
            .map(|(key, value)| {
                let stored: StoredUpdate = decode(&value)?;
                Ok(UpdateRecord {
                    id: read_u64(&key[16..])?,
                    document_id,
                    delta: decompress(&stored.delta)?,
                    author: stored.author,
                    created_at: stored.created_at,
                })
            })
            .collect()
    }

    fn latest_snapshot(&self, document_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        match self.scan_prefix(CF_SNAPSHOTS, document_id)?.pop() {
            Some((key, value)) => Self::decode_snapshot(document_id, &key, &value).map(Some),
            None => Ok(None),
        }
    }

    fn list_snapshots(&self, document_id: Uuid) -> Result<Vec<SnapshotRecord>, StoreError> {
        self.scan_prefix(CF_SNAPSHOTS, document_id)?
            .iter()
            .map(|(key, value)| Self::decode_snapshot(document_id, key, value))
            .collect()
    }

    fn insert_snapshot(&self, document_id: Uuid, state: &[u8]) -> Result<SnapshotRecord, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;
        let _guard = self.lock_writes();
        self.require_document(document_id)?;

        let version = match self.scan_prefix(CF_SNAPSHOTS, document_id)?.last() {
            Some((key, _)) => read_u64(&key[16..])? + 1,
            None => 1,
        };
        let stored = StoredSnapshot {
            created_at: Utc::now(),
            state: lz4_flex::compress_prepend_size(state),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, keyed(document_id, &version.to_be_bytes()), encode(&stored)?);
        batch.put_cf(cf_meta, keyed(document_id, META_SNAPSHOT_VERSION), version.to_be_bytes());
        self.write(batch)?;

        Ok(SnapshotRecord {
            document_id,
            version,
            state: state.to_vec(),
            created_at: stored.created_at,
        })
    }

    fn replace_blocks(
        &self,
        document_id: Uuid,
        snapshot_version: u64,
        blocks: &[ContentBlock],
    ) -> Result<usize, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let cf_meta = self.cf(CF_META)?;
        let _guard = self.lock_writes();
        self.require_document(document_id)?;

        let mut batch = WriteBatch::default();
        for (key, _) in self.scan_prefix(CF_BLOCKS, document_id)? {
            batch.delete_cf(cf, &key);
        }
        // Keyed by ordinal, not engine position, so duplicate positions
        // can never collapse two blocks into one row.
        for (ordinal, block) in blocks.iter().enumerate() {
            let block = ContentBlock {
                document_id,
                ..block.clone()
            };
            batch.put_cf(cf, keyed(document_id, &(ordinal as u32).to_be_bytes()), encode(&block)?);
        }
        batch.put_cf(cf_meta, keyed(document_id, META_INDEXED_VERSION), snapshot_version.to_be_bytes());
        self.write(batch)?;
        Ok(blocks.len())
    }

    fn list_blocks(&self, document_id: Uuid) -> Result<Vec<ContentBlock>, StoreError> {
        self.scan_prefix(CF_BLOCKS, document_id)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn all_blocks(&self) -> Result<Vec<ContentBlock>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        // The blocks CF has a prefix extractor; a full scan must ignore it.
        let mut read_opts = ReadOptions::default();
        read_opts.set_total_order_seek(true);
        let mut blocks = Vec::new();
        for item in self.db.iterator_cf_opt(cf, read_opts, IteratorMode::Start) {
            let (_, value) = item?;
            blocks.push(decode(&value)?);
        }
        Ok(blocks)
    }
}

/// Build a key: doc_id (16 bytes) + big-endian suffix.
fn keyed(doc_id: Uuid, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + suffix.len());
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(suffix);
    key
}

fn read_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Deserialization("truncated u64 key".into()))?;
    Ok(u64::from_be_bytes(buf))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
