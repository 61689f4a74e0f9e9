//! Retrieval engine: the shared index plus the injected oracles.
//!
//! # Ingest
//!
//! ```text
//! blocks ──► build_chunks ──► Embedder::embed (no lock held)
//!        ──► write lock: re-check source, add_document on a copy, rebuild
//!        ──► snapshot to [index].path, then swap the copy in
//! ```
//!
//! Embedding happens before the write lock is taken, so an oracle failure
//! leaves the index untouched. Replace embeds first and then swaps the old
//! chunks for the new ones inside one write-lock section.
//!
//! # Answer
//!
//! ```text
//! question ──► embed ──► read lock: hybrid top candidate_k, context windows
//!          ──► rerank::select ──► conflict::group_by_source
//!          ──► first group → context ──► Generator
//! ```
//!
//! Rerank, conflict and generation calls run with no lock held.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::chunk::build_chunks;
use crate::config::Config;
use crate::conflict::{self, Aggregation, ConflictReport, ConflictScorer};
use crate::embedding::{self, embed_query, Embedder};
use crate::error::{EngineError, Result};
use crate::generate::{self, assemble_context, GenerationRequest, Generator};
use crate::index::{HybridIndex, IndexParams};
use crate::lexical::normalize_whitespace;
use crate::models::{merge_by_source, Block, ChatMessage, Chunk, ExpandedCandidate, RankedGroup, ScoredChunk};
use crate::rerank::{self, Reranker};

/// The index behind a reader/writer lock.
pub type SharedIndex = RwLock<HybridIndex>;

/// Pipeline settings, normally taken from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub hybrid_alpha: f64,
    pub candidate_k: usize,
    pub context_neighbors: usize,
    pub rerank_top_k: usize,
    pub rerank_threshold: f32,
    pub conflict_threshold: f32,
    pub aggregation: Aggregation,
    pub merge_sources: bool,
    /// Snapshot written after every mutation; `None` for in-memory only.
    pub index_path: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_tokens: config.chunking.min_tokens,
            max_tokens: config.chunking.max_tokens,
            hybrid_alpha: config.retrieval.hybrid_alpha,
            candidate_k: config.retrieval.candidate_k,
            context_neighbors: config.retrieval.context_neighbors,
            rerank_top_k: config.rerank.top_k,
            rerank_threshold: config.rerank.threshold,
            conflict_threshold: config.conflict.threshold,
            aggregation: config.conflict.aggregation,
            merge_sources: config.generation.merge_sources,
            index_path: config.index.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Vector,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source: String,
    pub chunks: usize,
    pub tokens: usize,
    pub oversize_tables: usize,
    /// Chunks the document had before a replace.
    pub replaced: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub dimension: Option<usize>,
    pub embedding_model: String,
    pub built: bool,
}

/// Result of answering a chat.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// Generated text; `None` when no generator is configured.
    pub answer: Option<String>,
    /// Sources of the evidence the answer was built from.
    pub files_used: Vec<String>,
    /// That evidence, in rank order.
    pub groups: Vec<RankedGroup>,
    /// Context string handed to the generator.
    pub context: String,
    /// Sources left out because they contradict the answering group.
    pub set_aside: Vec<String>,
    pub conflicts: ConflictReport,
}

pub struct Engine {
    index: SharedIndex,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    conflict: Option<Arc<dyn ConflictScorer>>,
    generator: Option<Arc<dyn Generator>>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(index: HybridIndex, embedder: Arc<dyn Embedder>, options: EngineOptions) -> Self {
        Self {
            index: RwLock::new(index),
            embedder,
            reranker: None,
            conflict: None,
            generator: None,
            options,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_conflict_scorer(mut self, scorer: Arc<dyn ConflictScorer>) -> Self {
        self.conflict = Some(scorer);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Build an engine from configuration, loading the snapshot at
    /// `[index].path` when it exists.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let params: IndexParams = config.lexical.index_params();
        let index = match &config.index.path {
            Some(path) if path.exists() => HybridIndex::load(path, params)
                .map_err(|e| anyhow::anyhow!("Failed to load index {}: {}", path.display(), e))?,
            _ => HybridIndex::new(params),
        };

        let embedder: Arc<dyn Embedder> = Arc::from(embedding::create_embedder(&config.embedding)?);
        if let Some(dim) = index.dimension() {
            if dim != embedder.dims() {
                anyhow::bail!(
                    "index holds {}-dimensional vectors but embedding model '{}' produces {}",
                    dim,
                    embedder.model_name(),
                    embedder.dims()
                );
            }
        }

        let mut engine = Engine::new(index, embedder, EngineOptions::from_config(config));
        if let Some(r) = rerank::create_reranker(&config.rerank)? {
            engine = engine.with_reranker(Arc::from(r));
        }
        if let Some(c) = conflict::create_conflict_scorer(&config.conflict)? {
            engine = engine.with_conflict_scorer(Arc::from(c));
        }
        if let Some(g) = generate::create_generator(&config.generation)? {
            engine = engine.with_generator(Arc::from(g));
        }
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Cosine weight actually used: lexical only without an embedding model.
    fn alpha(&self, requested: Option<f64>) -> f64 {
        match requested {
            // Out-of-range values go through so the index rejects them.
            Some(a) if !(0.0..=1.0).contains(&a) => a,
            _ if self.embedder.dims() == 0 => 0.0,
            Some(a) => a,
            None => self.options.hybrid_alpha,
        }
    }

    /// Chunk and embed a document without touching the index.
    async fn prepare(&self, source: &str, blocks: &[Block]) -> Result<(Vec<Chunk>, Vec<Vec<f32>>)> {
        if source.trim().is_empty() {
            return Err(EngineError::InvalidArgument("source must not be empty".to_string()));
        }
        let chunks = build_chunks(source, blocks, self.options.min_tokens, self.options.max_tokens);
        if chunks.is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "document '{}' produced no chunks",
                source
            )));
        }
        let texts: Vec<String> = chunks.iter().map(|c| normalize_whitespace(&c.text)).collect();
        let vectors = self.embedder.embed(&texts).await?;
        Ok((chunks, vectors))
    }

    fn report(source: &str, chunks: &[Chunk], replaced: Option<usize>) -> IngestReport {
        IngestReport {
            source: source.to_string(),
            chunks: chunks.len(),
            tokens: chunks.iter().map(|c| c.chunk_size).sum(),
            oversize_tables: chunks.iter().filter(|c| c.oversize_table).count(),
            replaced,
        }
    }

    /// Apply `mutation` and rebuild. With a snapshot path the mutation runs
    /// on a copy, which replaces the live index once the snapshot is written.
    /// A failed write leaves the live index unchanged.
    fn commit<T>(&self, index: &mut HybridIndex, mutation: impl FnOnce(&mut HybridIndex) -> Result<T>) -> Result<T> {
        let Some(path) = &self.options.index_path else {
            let out = mutation(index)?;
            index.rebuild();
            return Ok(out);
        };
        let mut next = index.clone();
        let out = mutation(&mut next)?;
        next.rebuild();
        next.save(path)?;
        *index = next;
        Ok(out)
    }

    /// Add a new document. Fails with `DuplicateDocument` if `source` is
    /// already indexed.
    pub async fn ingest(&self, source: &str, blocks: &[Block]) -> Result<IngestReport> {
        if self.index.read().await.exists(source) {
            return Err(EngineError::DuplicateDocument(source.to_string()));
        }
        let (chunks, vectors) = self.prepare(source, blocks).await?;
        let report = Self::report(source, &chunks, None);

        let mut index = self.index.write().await;
        if index.exists(source) {
            return Err(EngineError::DuplicateDocument(source.to_string()));
        }
        self.commit(&mut index, |index| index.add_document(source, chunks, vectors))?;

        tracing::info!(source, chunks = report.chunks, "document ingested");
        Ok(report)
    }

    /// Replace an indexed document. Fails with `UnknownDocument` if
    /// `source` is not indexed.
    pub async fn replace(&self, source: &str, blocks: &[Block]) -> Result<IngestReport> {
        if !self.index.read().await.exists(source) {
            return Err(EngineError::UnknownDocument(source.to_string()));
        }
        let (chunks, vectors) = self.prepare(source, blocks).await?;
        let mut report = Self::report(source, &chunks, None);

        let mut index = self.index.write().await;
        if !index.exists(source) {
            return Err(EngineError::UnknownDocument(source.to_string()));
        }
        let previous = self.commit(&mut index, |index| index.replace_document(source, chunks, vectors))?;
        report.replaced = Some(previous);

        tracing::info!(
            source,
            chunks = report.chunks,
            previous = report.replaced.unwrap_or(0),
            "document replaced"
        );
        Ok(report)
    }

    /// Ingest when new, replace when present.
    pub async fn upsert(&self, source: &str, blocks: &[Block]) -> Result<IngestReport> {
        match self.replace(source, blocks).await {
            Err(EngineError::UnknownDocument(_)) => self.ingest(source, blocks).await,
            other => other,
        }
    }

    /// Remove a document. Returns the number of chunks removed.
    pub async fn remove(&self, source: &str) -> Result<usize> {
        let mut index = self.index.write().await;
        if !index.exists(source) {
            return Err(EngineError::UnknownDocument(source.to_string()));
        }
        let removed = self.commit(&mut index, |index| Ok(index.remove_document(source)))?;

        tracing::info!(source, chunks = removed, "document removed");
        Ok(removed)
    }

    pub async fn exists(&self, source: &str) -> bool {
        self.index.read().await.exists(source)
    }

    pub async fn sources(&self) -> Vec<(String, usize)> {
        self.index.read().await.sources()
    }

    pub async fn chunks_for(&self, source: &str) -> Vec<Chunk> {
        self.index.read().await.chunks_for(source)
    }

    pub async fn stats(&self) -> IndexStats {
        let index = self.index.read().await;
        IndexStats {
            documents: index.sources().len(),
            chunks: index.len(),
            dimension: index.dimension(),
            embedding_model: self.embedder.model_name().to_string(),
            built: index.is_built(),
        }
    }

    /// Ranked chunks for `query`.
    pub async fn search(&self, query: &str, k: usize, mode: SearchMode, alpha: Option<f64>) -> Result<Vec<ScoredChunk>> {
        let query_vec = match mode {
            SearchMode::Lexical => Vec::new(),
            SearchMode::Vector | SearchMode::Hybrid => embed_query(self.embedder.as_ref(), query).await?,
        };
        let index = self.index.read().await;
        match mode {
            SearchMode::Lexical => index.search_lexical(query, k),
            SearchMode::Vector => index.search_vector(&query_vec, k),
            SearchMode::Hybrid => index.search_hybrid(query, &query_vec, k, self.alpha(alpha)),
        }
    }

    /// Hybrid retrieval, context expansion and reranking for one question.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<RankedGroup>> {
        let query_vec = embed_query(self.embedder.as_ref(), question).await?;
        let candidates = {
            let index = self.index.read().await;
            let hits = index.search_hybrid(question, &query_vec, self.options.candidate_k, self.alpha(None))?;
            expand_candidates(&index, &hits, self.options.context_neighbors)
        };
        tracing::debug!(candidates = candidates.len(), "expanded candidates");

        rerank::select(
            self.reranker.as_deref(),
            question,
            candidates,
            self.options.rerank_top_k,
            self.options.rerank_threshold,
        )
        .await
    }

    /// Answer the last message of `chat` from indexed evidence.
    ///
    /// Earlier messages are passed to the generator as history. When the
    /// evidence splits into conflicting groups, the first group answers and
    /// the others are named in an attention note.
    pub async fn answer(&self, chat: &[ChatMessage]) -> Result<Answer> {
        let (last, history) = chat
            .split_last()
            .ok_or_else(|| EngineError::InvalidArgument("chat must not be empty".to_string()))?;
        let question = last.content.trim();
        if question.is_empty() {
            return Err(EngineError::InvalidArgument("question must not be empty".to_string()));
        }

        let ranked = self.retrieve(question).await?;
        let report = conflict::group_by_source(
            &ranked,
            self.conflict.as_deref(),
            self.options.conflict_threshold,
            self.options.aggregation,
        )
        .await?;

        let mut parts = conflict::partition_ranked(ranked, &report).into_iter();
        let mut groups = parts.next().unwrap_or_default();
        let set_aside: Vec<String> = report.groups.iter().skip(1).flatten().cloned().collect();
        if self.options.merge_sources {
            groups = merge_by_source(groups);
        }

        let mut files_used: Vec<String> = Vec::new();
        for g in &groups {
            if !files_used.contains(&g.source) {
                files_used.push(g.source.clone());
            }
        }

        let context = assemble_context(&groups);
        let attention = attention_note(&set_aside);
        let answer = match &self.generator {
            Some(generator) => {
                let request = GenerationRequest {
                    history,
                    question,
                    context: &context,
                    attention: attention.as_deref(),
                };
                Some(generator.generate(&request).await?)
            }
            None => None,
        };

        Ok(Answer {
            answer,
            files_used,
            groups,
            context,
            set_aside,
            conflicts: report,
        })
    }
}

fn attention_note(set_aside: &[String]) -> Option<String> {
    if set_aside.is_empty() {
        return None;
    }
    Some(format!(
        "Attention: the documents {} contradict the documents in the context and were left out. \
         Mention that the sources disagree.",
        set_aside.join(", ")
    ))
}

/// Widen each hit to its context window, keeping the hit's score.
pub fn expand_candidates(index: &HybridIndex, hits: &[ScoredChunk], neighbors: usize) -> Vec<ExpandedCandidate> {
    hits.iter()
        .map(|hit| {
            let window = index.context_window(hit.chunk.chunk_id, &hit.chunk.source, neighbors, true);
            ExpandedCandidate {
                source: hit.chunk.source.clone(),
                chunk_ids: window.iter().map(|c| c.chunk_id).collect(),
                texts: window.into_iter().map(|c| c.text).collect(),
                retrieval_score: hit.score,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;

    fn engine() -> Engine {
        let options = EngineOptions {
            min_tokens: 3,
            max_tokens: 8,
            ..Default::default()
        };
        Engine::new(HybridIndex::new(IndexParams::default()), Arc::new(DisabledEmbedder), options)
    }

    fn text(s: &str) -> Vec<Block> {
        vec![Block::Text(s.to_string())]
    }

    #[tokio::test]
    async fn test_ingest_then_duplicate() {
        let engine = engine();
        let report = engine
            .ingest("a", &text("First sentence here. Second sentence here."))
            .await
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(report.tokens, 6);
        let err = engine.ingest("a", &text("Other.")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDocument(_)));
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let engine = engine();
        let err = engine.remove("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownDocument(_)));
    }

    #[tokio::test]
    async fn test_lexical_only_without_embedder() {
        let engine = engine();
        engine.ingest("a", &text("Penalty for late delivery.")).await.unwrap();
        engine.ingest("b", &text("Sunny weather tomorrow.")).await.unwrap();
        let hits = engine.search("weather", 1, SearchMode::Hybrid, None).await.unwrap();
        assert_eq!(hits[0].chunk.source, "b");
    }

    #[tokio::test]
    async fn test_answer_without_generator() {
        let engine = engine();
        engine.ingest("a", &text("Penalty for late delivery.")).await.unwrap();
        let answer = engine
            .answer(&[ChatMessage::new("user", "late delivery penalty")])
            .await
            .unwrap();
        assert!(answer.answer.is_none());
        assert_eq!(answer.files_used, vec!["a"]);
        assert_eq!(answer.context, "Penalty for late delivery.");
    }

    #[tokio::test]
    async fn test_answer_rejects_empty_chat() {
        let err = engine().answer(&[]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_attention_note() {
        assert!(attention_note(&[]).is_none());
        let note = attention_note(&["b".to_string(), "c".to_string()]).unwrap();
        assert!(note.contains("b, c"));
    }
}
