//! Core data models used throughout Evidence Harness.
//!
//! These types represent the parsed blocks, chunks, search hits and ranked
//! evidence groups that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// One parsed fragment of a source document, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    /// A paragraph or run of plain text.
    Text(String),
    /// Ordered rows of ordered cells.
    Table(Vec<Vec<String>>),
}

/// Block as delivered by a parser over JSON: `{"type": ..., "content": ...}`.
///
/// Kept loose so that one unknown block type does not reject the whole
/// document; use [`parse_blocks`] to convert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

impl TryFrom<RawBlock> for Block {
    type Error = EngineError;

    fn try_from(raw: RawBlock) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "text" => Ok(Block::Text(value_to_string(&raw.content))),
            "table" => Ok(Block::Table(value_to_rows(&raw.content))),
            other => Err(EngineError::UnsupportedInputType(other.to_string())),
        }
    }
}

impl From<&Block> for RawBlock {
    fn from(block: &Block) -> Self {
        match block {
            Block::Text(text) => RawBlock {
                kind: "text".to_string(),
                content: Value::String(text.clone()),
            },
            Block::Table(rows) => RawBlock {
                kind: "table".to_string(),
                content: serde_json::json!(rows),
            },
        }
    }
}

/// Convert raw parser output into [`Block`]s, skipping unsupported types.
pub fn parse_blocks(raw: Vec<RawBlock>) -> Vec<Block> {
    raw.into_iter()
        .filter_map(|rb| match Block::try_from(rb) {
            Ok(block) => Some(block),
            Err(e) => {
                tracing::warn!(error = %e, "skipping block");
                None
            }
        })
        .collect()
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Tables arrive either as nested arrays or as pre-flattened text
/// (rows on lines, cells separated by tabs).
fn value_to_rows(v: &Value) -> Vec<Vec<String>> {
    match v {
        Value::Array(rows) => rows
            .iter()
            .map(|row| match row {
                Value::Array(cells) => cells.iter().map(value_to_string).collect(),
                other => vec![value_to_string(other)],
            })
            .collect(),
        Value::String(s) => s
            .lines()
            .map(|line| line.split('\t').map(|c| c.to_string()).collect())
            .collect(),
        Value::Null => Vec::new(),
        other => vec![vec![other.to_string()]],
    }
}

/// The retrievable unit: a bounded run of one document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// SHA-256 of `text`; the index key.
    pub chunk_hash: String,
    /// Position within the source document, starting at 0.
    pub chunk_id: usize,
    /// Document identifier (filename stem).
    pub source: String,
    pub text: String,
    /// Word-count token approximation of `text`.
    pub chunk_size: usize,
    /// Hashes of table fragments folded into this chunk.
    #[serde(default)]
    pub table_hashes: Vec<String>,
    /// Set when the chunk is a single table above the size ceiling that
    /// could not be split in two.
    #[serde(default)]
    pub oversize_table: bool,
}

/// A chunk with a retrieval score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub score: f64,
    pub chunk: Chunk,
}

/// A retrieved chunk expanded with its neighbours from the same document.
#[derive(Debug, Clone, Serialize)]
pub struct ExpandedCandidate {
    pub source: String,
    pub chunk_ids: Vec<usize>,
    pub texts: Vec<String>,
    /// Hybrid score of the chunk the window was centered on.
    pub retrieval_score: f64,
}

/// A candidate after the reranking stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedGroup {
    pub source: String,
    pub chunk_ids: Vec<usize>,
    pub texts: Vec<String>,
    /// Reranker relevance; `None` when no reranker was configured.
    pub score: Option<f32>,
}

impl RankedGroup {
    /// All texts of the group as one passage.
    pub fn joined_text(&self) -> String {
        self.texts.join(" ")
    }
}

impl From<ExpandedCandidate> for RankedGroup {
    fn from(c: ExpandedCandidate) -> Self {
        RankedGroup {
            source: c.source,
            chunk_ids: c.chunk_ids,
            texts: c.texts,
            score: None,
        }
    }
}

/// Merge groups of the same source into one, in first-encountered order.
///
/// Chunk ids repeated across overlapping windows are kept once and the
/// merged texts are ordered by chunk id. The best score of the merged
/// groups is kept.
pub fn merge_by_source(groups: Vec<RankedGroup>) -> Vec<RankedGroup> {
    let mut merged: Vec<RankedGroup> = Vec::new();
    for g in groups {
        match merged.iter_mut().find(|m| m.source == g.source) {
            Some(m) => {
                m.score = match (m.score, g.score) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                m.chunk_ids.extend(g.chunk_ids);
                m.texts.extend(g.texts);
            }
            None => merged.push(g),
        }
    }

    for m in &mut merged {
        let mut pairs: Vec<(usize, String)> = m
            .chunk_ids
            .drain(..)
            .zip(m.texts.drain(..))
            .collect();
        pairs.sort_by_key(|(id, _)| *id);
        pairs.dedup_by_key(|(id, _)| *id);
        let (ids, texts): (Vec<usize>, Vec<String>) = pairs.into_iter().unzip();
        m.chunk_ids = ids;
        m.texts = texts;
    }
    merged
}

/// One turn of a chat. `user` is accepted as an alias of `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(alias = "user")]
    pub role: String,
    #[serde(alias = "message")]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}
