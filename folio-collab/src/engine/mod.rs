//! Merge/extraction engine contract.
//!
//! The collaboration core never merges CRDT bytes itself. It hands an ordered
//! list of deltas to an engine and gets back one merged state, and it hands a
//! merged state back to get ordered text blocks for search.
//!
//! ```text
//!   deltas ──► apply()   ──► merged state ──► extract() ──► [ExtractedBlock]
//! ```
//!
//! - [`HttpEngine`] talks to the external engine service (`apply-updates`,
//!   `extract-blocks`), moving bytes as base64 text.
//! - [`YrsEngine`] does the same work in-process on a Yrs document.

pub mod http;
pub mod local;

pub use http::HttpEngine;
pub use local::YrsEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::storage::ContentBlock;

/// Which engine implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process [`YrsEngine`]
    #[default]
    Local,
    /// Remote [`HttpEngine`]
    Http,
}

/// `[engine]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Base URL of the remote engine, used when `kind = "http"`
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Local,
            base_url: "http://127.0.0.1:8787".to_string(),
            timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Instantiate the configured engine.
    pub fn build(&self) -> Result<Arc<dyn MergeEngine>, EngineError> {
        match self.kind {
            EngineKind::Local => Ok(Arc::new(YrsEngine::new())),
            EngineKind::Http => {
                let timeout = Duration::from_secs(self.timeout_secs.max(1));
                Ok(Arc::new(HttpEngine::new(self.base_url.clone(), timeout)?))
            }
        }
    }
}

/// Stateless apply/extract engine.
#[async_trait]
pub trait MergeEngine: Send + Sync {
    /// Merge `updates`, in order, into one encoded state.
    ///
    /// Fails if any delta is malformed.
    async fn apply(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError>;

    /// Extract ordered content blocks from an encoded state.
    ///
    /// An empty or absent document body yields an empty list.
    async fn extract(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError>;
}

/// One block as returned by `extract-blocks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default)]
    pub headings_path: Vec<String>,
    #[serde(default)]
    pub plain_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_json: Option<serde_json::Value>,
    pub position: u32,
}

impl ExtractedBlock {
    /// Bind the block to a document for storage.
    pub fn into_content_block(self, document_id: Uuid) -> ContentBlock {
        ContentBlock {
            document_id,
            block_type: self.block_type,
            heading_level: self.level,
            heading_path: self.headings_path,
            plain_text: self.plain_text,
            canonical_json: self.canonical_json.map(|v| v.to_string()),
            position: self.position,
        }
    }
}

/// Engine errors. Callers treat every variant as "skip this document this cycle".
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("delta {index} is malformed: {reason}")]
    MalformedDelta { index: usize, reason: String },
    #[error("merged state is malformed: {0}")]
    MalformedState(String),
    #[error("engine transport error: {0}")]
    Transport(String),
    #[error("engine returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("engine response is invalid: {0}")]
    InvalidResponse(String),
}
