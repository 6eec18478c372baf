//! Persistent storage for pages, their update logs, snapshots and search blocks.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append_update   ┌──────────────────────────────────────┐
//! │ MessageRouter│ ───────────────► │ DocumentStore (RocksDB)              │
//! └──────────────┘                  │                                      │
//! ┌──────────────┐  insert_snapshot │ CF "documents" - page records        │
//! │SnapshotWorker│ ───────────────► │ CF "updates"   - delta log (LZ4)     │
//! └──────────────┘                  │ CF "snapshots" - merged states (LZ4) │
//! ┌──────────────┐  replace_blocks  │ CF "blocks"    - search blocks       │
//! │IndexingWorker│ ───────────────► │ CF "meta"      - update sequence     │
//! └──────────────┘                  └──────────────────────────────────────┘
//! ```
//!
//! Every mutation is one `WriteBatch` scoped to a single document. The
//! update log is the source of truth; snapshots and blocks can always be
//! rebuilt from it.

pub mod model;
pub mod rocks;

pub use model::{slugify, ContentBlock, DocumentRecord, SnapshotRecord, UpdateRecord};
pub use rocks::{DocumentStore, StoreConfig};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The persistence seam used by the router, the workers and search.
///
/// Implementations must make each mutating call atomic for its document.
pub trait Repository: Send + Sync {
    /// Insert or replace a page record.
    fn put_document(&self, doc: &DocumentRecord) -> Result<(), StoreError>;

    fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, StoreError>;

    /// Delete a page together with its updates, snapshots and blocks.
    fn delete_document(&self, id: Uuid) -> Result<(), StoreError>;

    /// Pages whose `updated_at` is at or after `since`.
    fn documents_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Append one delta to a page's log and bump the page's `updated_at`.
    fn append_update(&self, document_id: Uuid, author: &str, delta: &[u8]) -> Result<UpdateRecord, StoreError>;

    /// The full update log of a page, in receive order.
    fn list_updates(&self, document_id: Uuid) -> Result<Vec<UpdateRecord>, StoreError>;

    fn latest_snapshot(&self, document_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError>;

    /// All snapshots of a page, oldest version first.
    fn list_snapshots(&self, document_id: Uuid) -> Result<Vec<SnapshotRecord>, StoreError>;

    /// Store a new snapshot as `latest version + 1` (or 1).
    fn insert_snapshot(&self, document_id: Uuid, state: &[u8]) -> Result<SnapshotRecord, StoreError>;

    /// Delete every block of a page and insert `blocks` in their place,
    /// recording `snapshot_version` as the page's indexed version.
    fn replace_blocks(
        &self,
        document_id: Uuid,
        snapshot_version: u64,
        blocks: &[ContentBlock],
    ) -> Result<usize, StoreError>;

    /// Pages whose latest snapshot is newer than their indexed version,
    /// regardless of `updated_at`.
    fn documents_pending_index(&self) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Snapshot version the page's blocks were last extracted from.
    fn indexed_version(&self, document_id: Uuid) -> Result<Option<u64>, StoreError>;

    /// A page's blocks in extraction order.
    fn list_blocks(&self, document_id: Uuid) -> Result<Vec<ContentBlock>, StoreError>;

    /// Every stored block, grouped by page.
    fn all_blocks(&self) -> Result<Vec<ContentBlock>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    /// Document not found
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
