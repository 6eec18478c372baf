//! Records persisted by the collaboration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A collaboratively edited page.
///
/// Owned by the surrounding CRUD system; this core reads `id` and
/// `project_id` for access checks and bumps `updated_at` on every appended
/// update so the background workers can find recently edited pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// New document with a fresh id and a slug derived from the title.
    pub fn new(project_id: Uuid, title: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), project_id, title)
    }

    pub fn with_id(id: Uuid, project_id: Uuid, title: impl Into<String>) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id,
            project_id,
            slug: slugify(&title),
            title,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One immutable CRDT delta in a document's update log.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    /// Store-wide sequence number; ascending order is receive order
    pub id: u64,
    pub document_id: Uuid,
    pub delta: Vec<u8>,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// A materialized merge of a document's full update log.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub document_id: Uuid,
    /// Monotonic per document, starting at 1
    pub version: u64,
    pub state: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A derived, disposable search block extracted from a snapshot.
///
/// Blocks have no identity across indexing passes: a document's whole set
/// is replaced every time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub document_id: Uuid,
    /// Engine block type, e.g. `paragraph`, `heading`, `bulletListItem`
    pub block_type: String,
    pub heading_level: Option<u8>,
    /// Titles of the enclosing headings, outermost first
    pub heading_path: Vec<String>,
    pub plain_text: String,
    pub canonical_json: Option<String>,
    pub position: u32,
}

impl ContentBlock {
    pub fn is_heading(&self) -> bool {
        self.heading_level.is_some()
    }

    /// Breadcrumb form of the heading path, e.g. `Setup > Install`.
    pub fn breadcrumb(&self) -> String {
        self.heading_path.join(" > ")
    }
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapsed into `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    slug
}
