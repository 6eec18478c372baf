//! Ranked lookup over extracted content blocks.
//!
//! Matching is case-insensitive substring search over a block's
//! `plain_text` and its `heading_path`. Hits are ordered by tier, then
//! page, then position:
//!
//! | tier | where the query matched                          |
//! |------|--------------------------------------------------|
//! | 0    | heading text, at a word start                    |
//! | 1    | heading text, inside a word                      |
//! | 2    | body text, at a word start                       |
//! | 3    | body text, inside a word                         |
//! | 4    | only the enclosing heading path of a body block  |
//!
//! Blocks are derived data: a search may see the previous indexing pass of
//! a page, never a partial one.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{ContentBlock, Repository, StoreError};

const SNIPPET_CHARS: usize = 120;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document_id: Uuid,
    pub block_type: String,
    pub heading_level: Option<u8>,
    pub heading_path: Vec<String>,
    pub position: u32,
    /// Lower ranks first
    pub tier: u8,
    /// Excerpt of `plain_text` around the first match
    pub snippet: String,
}

/// Heading autocomplete entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingSuggestion {
    pub document_id: Uuid,
    pub text: String,
    pub level: u8,
    pub heading_path: Vec<String>,
    pub position: u32,
}

pub struct SearchIndex {
    repo: Arc<dyn Repository>,
}

impl SearchIndex {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Ranked hits for `query`, optionally restricted to the pages in `scope`.
    pub fn search(&self, query: &str, scope: Option<&[Uuid]>, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let needle = fold(query.trim());
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .candidate_blocks(scope)?
            .into_iter()
            .filter_map(|block| rank(&block, &needle).map(|(tier, at)| hit(block, tier, at, needle.len())))
            .collect();

        hits.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then_with(|| a.position.cmp(&b.position))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Headings whose text has a word starting with `prefix`. Headings that
    /// start with the prefix come first, then shorter titles.
    pub fn suggest_headings(&self, prefix: &str, limit: usize) -> Result<Vec<HeadingSuggestion>, StoreError> {
        let needle = fold(prefix.trim());
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut ranked: Vec<(bool, HeadingSuggestion)> = Vec::new();
        for block in self.repo.all_blocks()? {
            let Some(level) = block.heading_level else {
                continue;
            };
            let text = fold(&block.plain_text);
            let starts = text.starts_with(&needle[..]);
            if !starts && !word_starts(&text).any(|at| text[at..].starts_with(&needle[..])) {
                continue;
            }
            if !seen.insert((block.document_id, block.plain_text.clone())) {
                continue;
            }
            ranked.push((
                starts,
                HeadingSuggestion {
                    document_id: block.document_id,
                    text: block.plain_text,
                    level,
                    heading_path: block.heading_path,
                    position: block.position,
                },
            ));
        }

        ranked.sort_by(|(a_starts, a), (b_starts, b)| {
            b_starts
                .cmp(a_starts)
                .then_with(|| a.text.chars().count().cmp(&b.text.chars().count()))
                .then_with(|| a.text.cmp(&b.text))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        Ok(ranked.into_iter().take(limit).map(|(_, s)| s).collect())
    }

    /// Pages belonging to `project_id`, for use as a search scope.
    pub fn project_scope(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .repo
            .documents_updated_since(DateTime::<Utc>::MIN_UTC)?
            .into_iter()
            .filter(|doc| doc.project_id == project_id)
            .map(|doc| doc.id)
            .collect())
    }

    fn candidate_blocks(&self, scope: Option<&[Uuid]>) -> Result<Vec<ContentBlock>, StoreError> {
        match scope {
            None => self.repo.all_blocks(),
            Some(ids) => {
                let mut blocks = Vec::new();
                let unique: HashSet<&Uuid> = ids.iter().collect();
                for id in unique {
                    blocks.extend(self.repo.list_blocks(*id)?);
                }
                Ok(blocks)
            }
        }
    }
}

// ─── Matching ────────────────────────────────────────────────────────────────

/// Lowercase per char, keeping a 1:1 index mapping to the original text.
fn fold(s: &str) -> Vec<char> {
    s.chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

fn word_starts(text: &[char]) -> impl Iterator<Item = usize> + '_ {
    (0..text.len()).filter(move |&i| text[i].is_alphanumeric() && (i == 0 || !text[i - 1].is_alphanumeric()))
}

/// Best match of `needle` in `text`: `(at_word_start, char offset)`.
fn find(text: &[char], needle: &[char]) -> Option<(bool, usize)> {
    if needle.len() > text.len() {
        return None;
    }
    let mut first = None;
    for at in 0..=text.len() - needle.len() {
        if text[at..].starts_with(needle) {
            let word_start = at == 0 || !text[at - 1].is_alphanumeric();
            if word_start {
                return Some((true, at));
            }
            first.get_or_insert(at);
        }
    }
    first.map(|at| (false, at))
}

/// Tier and match offset of `needle` in `block`, if it matches at all.
fn rank(block: &ContentBlock, needle: &[char]) -> Option<(u8, Option<usize>)> {
    let text = fold(&block.plain_text);
    if let Some((word_start, at)) = find(&text, needle) {
        let tier = match (block.is_heading(), word_start) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        };
        return Some((tier, Some(at)));
    }
    if block.is_heading() {
        return None;
    }
    block
        .heading_path
        .iter()
        .any(|title| find(&fold(title), needle).is_some())
        .then_some((4, None))
}

fn hit(block: ContentBlock, tier: u8, at: Option<usize>, needle_len: usize) -> SearchHit {
    let snippet = snippet(&block.plain_text, at.unwrap_or(0), needle_len);
    SearchHit {
        document_id: block.document_id,
        block_type: block.block_type,
        heading_level: block.heading_level,
        heading_path: block.heading_path,
        position: block.position,
        tier,
        snippet,
    }
}

fn snippet(text: &str, at: usize, len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let lead = (SNIPPET_CHARS.saturating_sub(len)) / 2;
    let start = at.saturating_sub(lead).min(chars.len() - SNIPPET_CHARS);
    let end = start + SNIPPET_CHARS;

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push('…');
    }
    out
}
