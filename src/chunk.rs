//! Block-aware chunk builder.
//!
//! Turns a document's parsed [`Block`]s into [`Chunk`]s whose token count
//! stays within `[min_tokens, max_tokens]`. Token counts are a word-count
//! approximation (whitespace-separated words).
//!
//! # Algorithm
//!
//! 1. Text blocks are split into sentences and packed greedily into a
//!    buffer while it stays under `max_tokens`. When a sentence would
//!    overflow, the buffer is flushed if it already holds `min_tokens`;
//!    otherwise the sentence is appended anyway. An oversize chunk is
//!    preferred to an undersize one.
//! 2. Tables are flattened (cells joined by `\t`, rows by `\n`) and hashed.
//!    A table always joins a non-empty buffer still under `min_tokens`.
//!    A table that is too large on its own, or would overflow the buffer,
//!    is offered one binary split: accepted only when the packer yields
//!    exactly two parts, both within bounds. Otherwise the table is
//!    emitted alone, flagged with [`Chunk::oversize_table`] if it exceeds
//!    `max_tokens`.
//! 3. The remaining buffer is flushed, then a second pass assigns
//!    `chunk_id` and `source`.
//!
//! # Example
//!
//! ```rust
//! use evidence_harness::chunk::build_chunks;
//! use evidence_harness::models::Block;
//!
//! let blocks = vec![Block::Text("Hello world. Second sentence.".to_string())];
//! let chunks = build_chunks("doc", &blocks, 1, 120);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_id, 0);
//! assert_eq!(chunks[0].chunk_size, 4);
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Block, Chunk};

/// Lower chunk bound used by the document gateway.
pub const DEFAULT_MIN_TOKENS: usize = 50;
/// Upper chunk bound used by the document gateway.
pub const DEFAULT_MAX_TOKENS: usize = 120;

const SENTENCE_TERMINALS: [char; 4] = ['.', '!', '?', '…'];
const CLOSING_MARKS: [char; 6] = ['"', '\'', ')', ']', '»', '”'];

/// Word-count token approximation.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Flatten table rows to text: cells joined by tabs, rows by newlines.
/// Rows with no non-blank cell are dropped.
pub fn flatten_table(rows: &[Vec<String>]) -> String {
    rows.iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            row.iter()
                .map(|cell| cell.trim())
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split text into sentence-like units.
///
/// A unit ends at `.`, `!`, `?` or `…` (plus any trailing closing quotes or
/// brackets) followed by whitespace, and at every line break, so table
/// rows come out one per unit.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            if !SENTENCE_TERMINALS.contains(&c) {
                continue;
            }
            while let Some(&next) = chars.peek() {
                if SENTENCE_TERMINALS.contains(&next) || CLOSING_MARKS.contains(&next) {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek().map_or(true, |n| n.is_whitespace()) {
                push_unit(&mut sentences, &mut current);
            }
        }
        push_unit(&mut sentences, &mut current);
    }

    sentences
}

fn push_unit(out: &mut Vec<String>, buf: &mut String) {
    let trimmed = buf.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    buf.clear();
}

/// Greedy sentence packer shared by text blocks and table splitting.
///
/// Packs `units` while the running size stays `<= max_tokens`. On overflow
/// the current part is closed only if it holds at least `min_tokens`;
/// otherwise the unit is appended regardless.
pub fn pack_units(units: &[String], min_tokens: usize, max_tokens: usize, sep: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for unit in units {
        let size = token_count(unit);
        if current_len + size > max_tokens && !current.is_empty() && current_len >= min_tokens {
            parts.push(current.join(sep));
            current.clear();
            current_len = 0;
        }
        current.push(unit);
        current_len += size;
    }

    if !current.is_empty() {
        parts.push(current.join(sep));
    }

    parts
}

/// Attempt the strict binary split of a flattened table.
///
/// Returns the two parts only when the packer yields exactly two and both
/// sit within `[min_tokens, max_tokens]`. No recursive splitting.
pub fn try_split_table(table_text: &str, min_tokens: usize, max_tokens: usize) -> Option<(String, String)> {
    let units = split_sentences(table_text);
    let mut parts = pack_units(&units, min_tokens, max_tokens, "\n");
    if parts.len() != 2 {
        return None;
    }
    let in_range = |p: &String| (min_tokens..=max_tokens).contains(&token_count(p));
    if !parts.iter().all(in_range) {
        return None;
    }
    let second = parts.pop()?;
    let first = parts.pop()?;
    Some((first, second))
}

/// A finished chunk before ids are assigned.
struct Pending {
    text: String,
    table_hashes: Vec<String>,
    oversize_table: bool,
}

/// The open buffer of the builder.
#[derive(Default)]
struct Accumulator {
    parts: Vec<String>,
    table_hashes: Vec<String>,
    size: usize,
}

impl Accumulator {
    fn push(&mut self, part: String, size: usize) {
        self.parts.push(part);
        self.size += size;
    }

    fn flush(&mut self, out: &mut Vec<Pending>) {
        let text = self.parts.join(" ").trim().to_string();
        if !text.is_empty() {
            out.push(Pending {
                text,
                table_hashes: std::mem::take(&mut self.table_hashes),
                oversize_table: false,
            });
        }
        self.parts.clear();
        self.table_hashes.clear();
        self.size = 0;
    }
}

/// Build bounded chunks for one document.
///
/// Returns chunks with contiguous `chunk_id`s starting at 0, all tagged
/// with `source`. An empty block list yields no chunks.
pub fn build_chunks(source: &str, blocks: &[Block], min_tokens: usize, max_tokens: usize) -> Vec<Chunk> {
    let mut pending: Vec<Pending> = Vec::new();
    let mut acc = Accumulator::default();

    for block in blocks {
        match block {
            Block::Text(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                for sentence in split_sentences(text) {
                    let size = token_count(&sentence);
                    if acc.size + size > max_tokens && acc.size >= min_tokens {
                        acc.flush(&mut pending);
                    }
                    acc.push(sentence, size);
                }
            }
            Block::Table(rows) => {
                let table_text = flatten_table(rows);
                if table_text.trim().is_empty() {
                    continue;
                }
                let size = token_count(&table_text);
                let hash = hash_text(&table_text);

                if acc.size > 0 && acc.size < min_tokens {
                    acc.push(table_text, size);
                    acc.table_hashes.push(hash);
                    continue;
                }

                if size > max_tokens || acc.size + size > max_tokens {
                    acc.flush(&mut pending);
                    match try_split_table(&table_text, min_tokens, max_tokens) {
                        Some((first, second)) => {
                            for part in [first, second] {
                                let part_hash = hash_text(&part);
                                pending.push(Pending {
                                    text: part,
                                    table_hashes: vec![part_hash],
                                    oversize_table: false,
                                });
                            }
                        }
                        None => {
                            if size > max_tokens {
                                tracing::debug!(
                                    source,
                                    tokens = size,
                                    max_tokens,
                                    "table split rejected, keeping oversize table chunk"
                                );
                            }
                            pending.push(Pending {
                                text: table_text,
                                table_hashes: vec![hash],
                                oversize_table: size > max_tokens,
                            });
                        }
                    }
                    continue;
                }

                acc.push(table_text, size);
                acc.table_hashes.push(hash);
            }
        }
    }

    acc.flush(&mut pending);

    pending
        .into_iter()
        .enumerate()
        .map(|(chunk_id, p)| Chunk {
            chunk_hash: hash_text(&p.text),
            chunk_id,
            source: source.to_string(),
            chunk_size: token_count(&p.text),
            text: p.text,
            table_hashes: p.table_hashes,
            oversize_table: p.oversize_table,
        })
        .collect()
}
