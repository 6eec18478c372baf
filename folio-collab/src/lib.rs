//! # folio-collab: Real-time collaborative page editing core
//!
//! Many users edit the same page at once; their CRDT deltas are logged,
//! relayed live to everyone else on the page, and folded in the background
//! into snapshots and search blocks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket (JSON envelopes)  ┌────────────┐   ┌───────────────┐
//! │ Client A │ ◄──────────────────────────► │ SyncServer │──►│ MessageRouter │
//! │ Client B │        ?page_id & token      │ (gate)     │   └──────┬────────┘
//! └──────────┘                              └─────┬──────┘          │ append_update
//!                                                 │ register        ▼
//!                                          ┌──────┴──────┐   ┌──────────────┐
//!                                          │ RoomManager │◄──│ DocumentStore│
//!                                          │ (fan-out)   │   │ (RocksDB)    │
//!                                          └─────────────┘   └──────┬───────┘
//!                                                                   │ recent pages
//!                                             ┌─────────────────────┼──────────────────┐
//!                                             ▼                                        ▼
//!                                     ┌────────────────┐   apply / extract   ┌────────────────┐
//!                                     │ SnapshotWorker │ ──► MergeEngine ◄── │ IndexingWorker │
//!                                     └────────────────┘                     └───────┬────────┘
//!                                                                                    ▼
//!                                                                              SearchIndex
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope wire protocol, base64 deltas
//! - [`hub`]: Per-page rooms, client pumps, best-effort fan-out
//! - [`router`]: Inbound message dispatch
//! - [`server`]: WebSocket endpoint and handshake gate
//! - [`access`]: Token and project access capability, Origin policy
//! - [`storage`]: Update log, snapshots, content blocks (RocksDB)
//! - [`engine`]: Merge/extraction engine contract (HTTP and in-process Yrs)
//! - [`worker`]: Snapshot and indexing background loops
//! - [`search`]: Ranked block search and heading suggestions
//! - [`config`]: TOML + environment configuration

pub mod access;
pub mod config;
pub mod engine;
pub mod hub;
pub mod protocol;
pub mod router;
pub mod search;
pub mod server;
pub mod storage;
pub mod worker;

// Re-exports for convenience
pub use access::{AccessConfig, AccessControl, AccessError, OriginPolicy, StaticAccess};
pub use config::{Config, ConfigError};
pub use engine::{EngineConfig, EngineError, EngineKind, ExtractedBlock, HttpEngine, MergeEngine, YrsEngine};
pub use hub::{BroadcastOutcome, BroadcastStats, ClientHandle, ClientQueue, RoomManager};
pub use protocol::{ClientMessage, Envelope, ErrorCode, MessageType, ProtocolError};
pub use router::{MessageHandler, MessageRouter, Routed};
pub use search::{HeadingSuggestion, SearchHit, SearchIndex};
pub use server::{Grant, HandshakeGate, ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{
    ContentBlock, DocumentRecord, DocumentStore, Repository, SnapshotRecord, StoreConfig, StoreError,
    UpdateRecord,
};
pub use worker::{
    spawn_worker, BackgroundJob, CycleReport, IndexOutcome, IndexingWorker, SnapshotOutcome, SnapshotWorker,
    WorkerConfig, WorkerError,
};
