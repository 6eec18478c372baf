//! In-process engine backed by a Yrs document.
//!
//! Merging replays every delta into a fresh `Doc` and re-encodes the full
//! state against an empty state vector, so the same delta sequence always
//! produces the same bytes.
//!
//! Extraction reads the `content` text root and splits it into blocks using
//! a small markdown-ish line grammar:
//!
//! | Line                     | Block type         |
//! |--------------------------|--------------------|
//! | `#`..`######` + space    | `heading` (level)  |
//! | `- `, `* `, `+ `         | `bulletListItem`   |
//! | `1. `, `2) `             | `numberedListItem` |
//! | `> `                     | `quote`            |
//! | fenced with three backticks | `codeBlock`     |
//! | anything else            | `paragraph`        |
//!
//! Consecutive plain lines join into one paragraph; a blank line ends it.

use async_trait::async_trait;
use serde_json::json;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

use super::{EngineError, ExtractedBlock, MergeEngine};

/// Name of the text root holding a page body.
pub const CONTENT_ROOT: &str = "content";

const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, Default)]
pub struct YrsEngine;

impl YrsEngine {
    pub fn new() -> Self {
        Self
    }

    /// Replay `updates` in order and encode the merged state.
    pub fn merge(updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for (index, bytes) in updates.iter().enumerate() {
                let update = Update::decode_v1(bytes).map_err(|e| EngineError::MalformedDelta {
                    index,
                    reason: e.to_string(),
                })?;
                txn.apply_update(update).map_err(|e| EngineError::MalformedDelta {
                    index,
                    reason: e.to_string(),
                })?;
            }
        }
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Plain body text of an encoded state. Empty if the page has no body.
    pub fn body_text(state: &[u8]) -> Result<String, EngineError> {
        if state.is_empty() {
            return Ok(String::new());
        }
        let update = Update::decode_v1(state).map_err(|e| EngineError::MalformedState(e.to_string()))?;
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::MalformedState(e.to_string()))?;
        }
        let txn = doc.transact();
        Ok(txn
            .get_text(CONTENT_ROOT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default())
    }

    /// Split body text into ordered blocks.
    pub fn blocks_from_text(body: &str) -> Vec<ExtractedBlock> {
        let mut out = BlockWriter::default();
        let mut paragraph: Vec<&str> = Vec::new();
        let mut code: Option<(String, Vec<&str>)> = None;

        for line in body.lines() {
            if let Some((language, lines)) = code.as_mut() {
                if line.trim_start().starts_with(FENCE) {
                    let language = std::mem::take(language);
                    let text = lines.join("\n");
                    out.push_code(language, text);
                    code = None;
                } else {
                    lines.push(line);
                }
                continue;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                out.flush_paragraph(&mut paragraph);
                continue;
            }

            if let Some(language) = trimmed.strip_prefix(FENCE) {
                out.flush_paragraph(&mut paragraph);
                code = Some((language.trim().to_string(), Vec::new()));
                continue;
            }

            if let Some((level, title)) = parse_heading(trimmed) {
                out.flush_paragraph(&mut paragraph);
                out.push_heading(level, title);
                continue;
            }

            if let Some((block_type, text)) = parse_list_or_quote(trimmed) {
                out.flush_paragraph(&mut paragraph);
                out.push(block_type, text.to_string(), None);
                continue;
            }

            paragraph.push(trimmed);
        }

        out.flush_paragraph(&mut paragraph);
        if let Some((language, lines)) = code {
            out.push_code(language, lines.join("\n"));
        }
        out.blocks
    }
}

#[async_trait]
impl MergeEngine for YrsEngine {
    async fn apply(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        Self::merge(updates)
    }

    async fn extract(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError> {
        let body = Self::body_text(state)?;
        Ok(Self::blocks_from_text(&body))
    }
}

// ─── Block Assembly ──────────────────────────────────────────────────────────

#[derive(Default)]
struct BlockWriter {
    blocks: Vec<ExtractedBlock>,
    /// Open headings as (level, title), outermost first
    headings: Vec<(u8, String)>,
}

impl BlockWriter {
    fn path(&self) -> Vec<String> {
        self.headings.iter().map(|(_, title)| title.clone()).collect()
    }

    fn push(&mut self, block_type: &str, plain_text: String, canonical: Option<serde_json::Value>) {
        let position = self.blocks.len() as u32;
        self.blocks.push(ExtractedBlock {
            block_type: block_type.to_string(),
            level: None,
            headings_path: self.path(),
            plain_text,
            canonical_json: canonical,
            position,
        });
    }

    fn push_heading(&mut self, level: u8, title: &str) {
        self.headings.retain(|(open, _)| *open < level);
        let position = self.blocks.len() as u32;
        self.blocks.push(ExtractedBlock {
            block_type: "heading".to_string(),
            level: Some(level),
            headings_path: self.path(),
            plain_text: title.to_string(),
            canonical_json: Some(json!({ "type": "heading", "attrs": { "level": level } })),
            position,
        });
        self.headings.push((level, title.to_string()));
    }

    fn push_code(&mut self, language: String, text: String) {
        let canonical = json!({ "type": "codeBlock", "attrs": { "language": language } });
        self.push("codeBlock", text, Some(canonical));
    }

    fn flush_paragraph(&mut self, lines: &mut Vec<&str>) {
        if lines.is_empty() {
            return;
        }
        let text = lines.join(" ");
        lines.clear();
        self.push("paragraph", text, None);
    }
}

fn parse_heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    let title = rest.strip_prefix(' ')?.trim();
    if title.is_empty() {
        return None;
    }
    Some((hashes as u8, title))
}

fn parse_list_or_quote(line: &str) -> Option<(&'static str, &str)> {
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(("bulletListItem", rest.trim()));
        }
    }
    if let Some(rest) = line.strip_prefix("> ") {
        return Some(("quote", rest.trim()));
    }
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(text) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(("numberedListItem", text.trim()));
        }
    }
    None
}
