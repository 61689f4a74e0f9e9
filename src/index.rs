//! Hybrid vector + BM25 index over chunks.
//!
//! Every chunk is one [`IndexEntry`] in a single arena holding its payload,
//! raw vector, unit vector and lexical tokens. Entries are kept in
//! insertion order; removing a document compacts the arena.
//!
//! # Lifecycle
//!
//! ```text
//! add_document / remove_document ──► stale ──► rebuild() ──► built ──► search_*
//! ```
//!
//! Mutations mark the index stale; every query on a stale index fails with
//! [`EngineError::IndexNotBuilt`] until [`HybridIndex::rebuild`] normalizes
//! the vectors and rebuilds the BM25 statistics. A fresh empty index is
//! built.
//!
//! # Scoring
//!
//! | Mode | Score |
//! |------|-------|
//! | vector | `unit(q) · unit(d)` |
//! | lexical | BM25L, min-max rescaled |
//! | hybrid | `alpha * cosine + (1 - alpha) * lexical` |
//!
//! Top-k selection is a stable descending sort, so ties keep insertion order.
//!
//! # Persistence
//!
//! [`HybridIndex::save`] writes one JSON [`IndexSnapshot`] through a temp
//! file and a rename. [`HybridIndex::load`] validates the snapshot and
//! rebuilds, so a loaded index is immediately queryable.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{dot, l2_normalize};
use crate::error::{EngineError, Result};
use crate::lexical::{rescale_scores, tokenize, Bm25, Bm25Params, StemLanguage};
use crate::models::{Chunk, ScoredChunk};

const SNAPSHOT_VERSION: u32 = 1;

/// Lexical settings fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexParams {
    pub bm25: Bm25Params,
    pub language: StemLanguage,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    /// L2-normalized `vector`; refreshed by `rebuild`.
    pub unit: Vec<f32>,
    pub tokens: Vec<String>,
}

/// On-disk form of the index.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub dimension: Option<usize>,
    pub matrix: Vec<Vec<f32>>,
    pub norm_matrix: Vec<Vec<f32>>,
    pub payloads: Vec<Chunk>,
    pub ids: Vec<String>,
    pub lexical_corpus: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct HybridIndex {
    params: IndexParams,
    entries: Vec<IndexEntry>,
    dimension: Option<usize>,
    bm25: Bm25,
    built: bool,
}

impl HybridIndex {
    pub fn new(params: IndexParams) -> Self {
        let empty: Vec<Vec<String>> = Vec::new();
        Self {
            params,
            entries: Vec::new(),
            dimension: None,
            bm25: Bm25::new(&empty, params.bm25),
            built: true,
        }
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vector dimension, fixed by the first document added.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn exists(&self, source: &str) -> bool {
        self.entries.iter().any(|e| e.chunk.source == source)
    }

    /// Indexed sources with their chunk counts, in first-insertion order.
    pub fn sources(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = Vec::new();
        for entry in &self.entries {
            match out.iter_mut().find(|(s, _)| *s == entry.chunk.source) {
                Some((_, count)) => *count += 1,
                None => out.push((entry.chunk.source.clone(), 1)),
            }
        }
        out
    }

    /// Check a document batch. Returns the vector dimension the index will
    /// have after the batch is added. When `replacing`, the current chunks
    /// of `source` do not pin the dimension.
    fn check_batch(&self, source: &str, chunks: &[Chunk], vectors: &[Vec<f32>], replacing: bool) -> Result<Option<usize>> {
        if chunks.len() != vectors.len() {
            return Err(EngineError::InvalidArgument(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if let Some(c) = chunks.iter().find(|c| c.source != source) {
            return Err(EngineError::InvalidArgument(format!(
                "chunk {} belongs to '{}', not '{}'",
                c.chunk_id, c.source, source
            )));
        }

        let others = self.entries.iter().any(|e| e.chunk.source != source);
        let current = if replacing && !others { None } else { self.dimension };
        let expected = current.or_else(|| vectors.first().map(|v| v.len()));
        if let Some(expected) = expected {
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }
        Ok(expected)
    }

    fn append(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) {
        let language = self.params.language;
        self.entries
            .extend(chunks.into_iter().zip(vectors).map(|(chunk, vector)| IndexEntry {
                tokens: tokenize(&chunk.text, language),
                chunk,
                vector,
                unit: Vec::new(),
            }));
    }

    /// Append one document's chunks with their vectors.
    ///
    /// All chunks are added or none are. The index must be rebuilt before
    /// the next query.
    pub fn add_document(&mut self, source: &str, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        if self.exists(source) {
            return Err(EngineError::DuplicateDocument(source.to_string()));
        }
        let dimension = self.check_batch(source, &chunks, &vectors, false)?;
        if chunks.is_empty() {
            return Ok(());
        }
        self.append(chunks, vectors);
        self.dimension = dimension;
        self.built = false;
        Ok(())
    }

    /// Swap the chunks of an indexed document for new ones. The batch is
    /// validated before anything is removed. Returns the number of chunks
    /// replaced.
    pub fn replace_document(&mut self, source: &str, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<usize> {
        if !self.exists(source) {
            return Err(EngineError::UnknownDocument(source.to_string()));
        }
        let dimension = self.check_batch(source, &chunks, &vectors, true)?;
        let removed = self.remove_document(source);
        if !chunks.is_empty() {
            self.append(chunks, vectors);
            self.dimension = dimension;
        }
        self.built = false;
        Ok(removed)
    }

    /// Remove every chunk of `source`. Returns the number removed; an
    /// absent source removes nothing and leaves the index as it was.
    pub fn remove_document(&mut self, source: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.chunk.source != source);
        let removed = before - self.entries.len();
        if removed > 0 {
            if self.entries.is_empty() {
                self.dimension = None;
            }
            self.built = false;
        }
        removed
    }

    /// Normalize vectors and rebuild the lexical ranker.
    pub fn rebuild(&mut self) {
        for entry in &mut self.entries {
            entry.unit = l2_normalize(&entry.vector);
        }
        let corpus: Vec<&[String]> = self.entries.iter().map(|e| e.tokens.as_slice()).collect();
        self.bm25 = Bm25::new(&corpus, self.params.bm25);
        self.built = true;
        tracing::debug!(chunks = self.entries.len(), "index rebuilt");
    }

    fn ensure_built(&self) -> Result<()> {
        if self.built {
            Ok(())
        } else {
            Err(EngineError::IndexNotBuilt)
        }
    }

    fn cosine_scores(&self, query_vec: &[f32]) -> Result<Vec<f64>> {
        if let Some(expected) = self.dimension {
            if query_vec.len() != expected {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    actual: query_vec.len(),
                });
            }
        }
        let q = l2_normalize(query_vec);
        Ok(self
            .entries
            .iter()
            .map(|e| dot(&q, &e.unit) as f64)
            .collect())
    }

    fn lexical_scores(&self, query: &str) -> Vec<f64> {
        let tokens = tokenize(query, self.params.language);
        rescale_scores(&self.bm25.scores(&tokens))
    }

    fn top_k(&self, scores: &[f64], k: usize) -> Vec<ScoredChunk> {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        // NaN ranks below every real score.
        let key = |i: usize| if scores[i].is_nan() { f64::NEG_INFINITY } else { scores[i] };
        order.sort_by(|&a, &b| key(b).total_cmp(&key(a)));
        order
            .into_iter()
            .take(k)
            .map(|i| ScoredChunk {
                score: scores[i],
                chunk: self.entries[i].chunk.clone(),
            })
            .collect()
    }

    /// Top-k chunks by cosine similarity.
    pub fn search_vector(&self, query_vec: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        self.ensure_built()?;
        let scores = self.cosine_scores(query_vec)?;
        Ok(self.top_k(&scores, k))
    }

    /// Top-k chunks by rescaled BM25L.
    pub fn search_lexical(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        self.ensure_built()?;
        let scores = self.lexical_scores(query);
        Ok(self.top_k(&scores, k))
    }

    /// Top-k chunks by `alpha * cosine + (1 - alpha) * lexical`.
    pub fn search_hybrid(&self, query: &str, query_vec: &[f32], k: usize, alpha: f64) -> Result<Vec<ScoredChunk>> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(EngineError::InvalidArgument(format!(
                "alpha must be in [0, 1], got {}",
                alpha
            )));
        }
        self.ensure_built()?;
        let cos = self.cosine_scores(query_vec)?;
        let lex = self.lexical_scores(query);
        let scores: Vec<f64> = cos
            .iter()
            .zip(&lex)
            .map(|(c, l)| alpha * c + (1.0 - alpha) * l)
            .collect();
        Ok(self.top_k(&scores, k))
    }

    /// Chunks of `source` with ids in `[chunk_id - n, chunk_id + n]`, ordered
    /// by id. Empty when `(source, chunk_id)` is not indexed.
    pub fn context_window(&self, chunk_id: usize, source: &str, n: usize, include_self: bool) -> Vec<Chunk> {
        let doc: Vec<&Chunk> = self
            .entries
            .iter()
            .map(|e| &e.chunk)
            .filter(|c| c.source == source)
            .collect();
        if !doc.iter().any(|c| c.chunk_id == chunk_id) {
            return Vec::new();
        }

        let lo = chunk_id.saturating_sub(n);
        let hi = chunk_id.saturating_add(n);
        let mut window: Vec<Chunk> = doc
            .into_iter()
            .filter(|c| c.chunk_id >= lo && c.chunk_id <= hi)
            .filter(|c| include_self || c.chunk_id != chunk_id)
            .cloned()
            .collect();
        window.sort_by_key(|c| c.chunk_id);
        window
    }

    /// Every chunk of `source`, ordered by id.
    pub fn chunks_for(&self, source: &str) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self
            .entries
            .iter()
            .filter(|e| e.chunk.source == source)
            .map(|e| e.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.chunk_id);
        chunks
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            dimension: self.dimension,
            matrix: self.entries.iter().map(|e| e.vector.clone()).collect(),
            norm_matrix: self.entries.iter().map(|e| l2_normalize(&e.vector)).collect(),
            payloads: self.entries.iter().map(|e| e.chunk.clone()).collect(),
            ids: self.entries.iter().map(|e| e.chunk.chunk_hash.clone()).collect(),
            lexical_corpus: self.entries.iter().map(|e| e.tokens.clone()).collect(),
        }
    }

    /// Write the snapshot to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec(&self.snapshot())?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), chunks = self.entries.len(), "index saved");
        Ok(())
    }

    pub fn from_snapshot(snapshot: IndexSnapshot, params: IndexParams) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Persistence(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let n = snapshot.payloads.len();
        if snapshot.matrix.len() != n || snapshot.ids.len() != n || snapshot.lexical_corpus.len() != n {
            return Err(EngineError::Persistence(format!(
                "snapshot arrays disagree: {} payloads, {} vectors, {} ids, {} token lists",
                n,
                snapshot.matrix.len(),
                snapshot.ids.len(),
                snapshot.lexical_corpus.len()
            )));
        }
        if let Some(expected) = snapshot.dimension {
            if let Some(bad) = snapshot.matrix.iter().find(|v| v.len() != expected) {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }
        if let Some((chunk, id)) = snapshot
            .payloads
            .iter()
            .zip(&snapshot.ids)
            .find(|(c, id)| c.chunk_hash != **id)
        {
            return Err(EngineError::Persistence(format!(
                "id {} does not match payload hash {}",
                id, chunk.chunk_hash
            )));
        }

        let mut index = HybridIndex::new(params);
        index.dimension = if n == 0 { None } else { snapshot.dimension };
        index.entries = snapshot
            .payloads
            .into_iter()
            .zip(snapshot.matrix)
            .zip(snapshot.lexical_corpus)
            .map(|((chunk, vector), tokens)| IndexEntry {
                chunk,
                vector,
                unit: Vec::new(),
                tokens,
            })
            .collect();
        index.rebuild();
        Ok(index)
    }

    /// Load a snapshot written by [`HybridIndex::save`].
    pub fn load(path: &Path, params: IndexParams) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)?;
        let index = Self::from_snapshot(snapshot, params)?;
        tracing::info!(path = %path.display(), chunks = index.len(), "index loaded");
        Ok(index)
    }
}
