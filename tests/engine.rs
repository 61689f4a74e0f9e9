use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use evidence_harness::chunk::build_chunks;
use evidence_harness::config::parse_config;
use evidence_harness::conflict::ConflictScorer;
use evidence_harness::embedding::Embedder;
use evidence_harness::engine::{Engine, EngineOptions, SearchMode};
use evidence_harness::error::{EngineError, Result};
use evidence_harness::generate::{GenerationRequest, Generator};
use evidence_harness::index::{HybridIndex, IndexParams};
use evidence_harness::models::{Block, ChatMessage};
use evidence_harness::rerank::Reranker;

const DIMS: usize = 16;

/// Bag-of-words hashed into `DIMS` buckets. Fails while `fail` is set.
#[derive(Default)]
struct HashEmbedder {
    fail: AtomicBool,
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::oracle("embedding", "connection refused"));
        }
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for word in t.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                    let bucket = word.bytes().map(usize::from).sum::<usize>() % DIMS;
                    v[bucket] += 1.0;
                }
                v
            })
            .collect())
    }
}

struct KeywordReranker;

#[async_trait]
impl Reranker for KeywordReranker {
    fn name(&self) -> &str {
        "keyword"
    }
    async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
        Ok(texts
            .iter()
            .map(|t| if t.contains("penalty") { 0.9 } else { 0.1 })
            .collect())
    }
}

/// Records every text it is asked to embed.
#[derive(Default)]
struct RecordingEmbedder {
    inner: HashEmbedder,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Embedder for RecordingEmbedder {
    fn model_name(&self) -> &str {
        "recording"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.seen.lock().unwrap().extend(texts.iter().cloned());
        self.inner.embed(texts).await
    }
}

/// "ten days" contradicts "thirty days".
struct DeadlineConflicts;

#[async_trait]
impl ConflictScorer for DeadlineConflicts {
    fn name(&self) -> &str {
        "deadline"
    }
    async fn contradiction(&self, a: &str, b: &str) -> Result<f32> {
        let ten = |s: &str| s.contains("ten days");
        let thirty = |s: &str| s.contains("thirty days");
        Ok(if (ten(a) && thirty(b)) || (thirty(a) && ten(b)) { 0.95 } else { 0.02 })
    }
}

#[derive(Default)]
struct RecordingGenerator {
    seen: Mutex<Vec<(usize, String, String, Option<String>)>>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    fn name(&self) -> &str {
        "recording"
    }
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        self.seen.lock().unwrap().push((
            request.history.len(),
            request.question.to_string(),
            request.context.to_string(),
            request.attention.map(str::to_string),
        ));
        Ok("Ten or thirty days, the sources disagree.".to_string())
    }
}

fn text(s: &str) -> Vec<Block> {
    vec![Block::Text(s.to_string())]
}

fn engine_with(embedder: Arc<HashEmbedder>) -> Engine {
    Engine::new(HybridIndex::new(IndexParams::default()), embedder, EngineOptions::default())
}

async fn load_contracts(engine: &Engine) {
    engine
        .ingest("supplier-a", &text("Late delivery penalty applies after ten days."))
        .await
        .unwrap();
    engine
        .ingest("supplier-b", &text("Late delivery penalty applies after thirty days."))
        .await
        .unwrap();
    engine
        .ingest("weather", &text("Sunny weather is expected tomorrow afternoon."))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ingest_is_atomic_on_embedder_failure() {
    let embedder = Arc::new(HashEmbedder::default());
    let engine = engine_with(embedder.clone());
    engine.ingest("kept", &text("Existing document text.")).await.unwrap();

    embedder.fail.store(true, Ordering::SeqCst);
    let err = engine.ingest("new", &text("Never indexed.")).await.unwrap_err();
    assert!(matches!(err, EngineError::OracleUnavailable { oracle: "embedding", .. }));

    assert!(!engine.exists("new").await);
    let stats = engine.stats().await;
    assert_eq!((stats.documents, stats.chunks), (1, 1));
    assert!(stats.built);
}

#[tokio::test]
async fn test_replace_keeps_old_chunks_on_embedder_failure() {
    let embedder = Arc::new(HashEmbedder::default());
    let engine = engine_with(embedder.clone());
    engine.ingest("doc", &text("Version one of the text.")).await.unwrap();

    embedder.fail.store(true, Ordering::SeqCst);
    assert!(engine.replace("doc", &text("Version two.")).await.is_err());
    let chunks = engine.chunks_for("doc").await;
    assert_eq!(chunks[0].text, "Version one of the text.");

    embedder.fail.store(false, Ordering::SeqCst);
    let report = engine.replace("doc", &text("Version two.")).await.unwrap();
    assert_eq!(report.replaced, Some(1));
    assert_eq!(engine.chunks_for("doc").await[0].text, "Version two.");
}

#[tokio::test]
async fn test_replace_unknown_document() {
    let engine = engine_with(Arc::new(HashEmbedder::default()));
    let err = engine.replace("ghost", &text("x y z")).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownDocument(s) if s == "ghost"));
    let report = engine.upsert("ghost", &text("x y z")).await.unwrap();
    assert_eq!(report.replaced, None);
    assert!(engine.exists("ghost").await);
}

#[tokio::test]
async fn test_failed_snapshot_write_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("index.json");
    let options = EngineOptions {
        index_path: Some(index_path.clone()),
        ..EngineOptions::default()
    };
    let engine = Engine::new(
        HybridIndex::new(IndexParams::default()),
        Arc::new(HashEmbedder::default()),
        options,
    );
    engine.ingest("kept", &text("Version one of the kept text.")).await.unwrap();
    assert!(index_path.is_file());

    // A directory in place of the snapshot makes every later write fail.
    std::fs::remove_file(&index_path).unwrap();
    std::fs::create_dir(&index_path).unwrap();

    let err = engine.ingest("new", &text("Never persisted.")).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(!engine.exists("new").await);

    let err = engine.remove("kept").await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(engine.exists("kept").await);

    let err = engine.replace("kept", &text("Version two.")).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert_eq!(engine.chunks_for("kept").await[0].text, "Version one of the kept text.");

    let stats = engine.stats().await;
    assert_eq!((stats.documents, stats.chunks), (1, 1));
    assert!(stats.built);
}

#[tokio::test]
async fn test_document_without_chunks_is_rejected() {
    let engine = engine_with(Arc::new(HashEmbedder::default()));
    let err = engine.ingest("blank", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert!(!engine.exists("blank").await);

    let err = engine.ingest("spaces", &text("   \n\t ")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert!(engine.sources().await.is_empty());

    engine.ingest("doc", &text("Real words here.")).await.unwrap();
    let err = engine.replace("doc", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert_eq!(engine.chunks_for("doc").await.len(), 1);
}

#[tokio::test]
async fn test_embedded_texts_are_whitespace_normalized() {
    let embedder = Arc::new(RecordingEmbedder::default());
    let engine = Engine::new(HybridIndex::new(IndexParams::default()), embedder.clone(), EngineOptions::default());
    engine
        .ingest("doc", &[Block::Table(vec![
            vec!["Part".to_string(), "Lead\ttime".to_string()],
            vec!["Motor".to_string(), "ten\ndays".to_string()],
        ])])
        .await
        .unwrap();
    engine
        .search("  motor\t lead\n time ", 1, SearchMode::Vector, None)
        .await
        .unwrap();

    let seen = embedder.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for t in seen.iter() {
        assert!(!t.contains(['\t', '\n']), "unnormalized text: {:?}", t);
        assert!(!t.contains("  "), "unnormalized text: {:?}", t);
        assert_eq!(t.trim(), t);
    }
    assert_eq!(seen[1], "motor lead time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_searches_run_alongside_ingests() {
    let engine = Arc::new(engine_with(Arc::new(HashEmbedder::default())));
    engine.ingest("seed", &text("Delivery penalty seed document.")).await.unwrap();

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let source = format!("doc-{}", i);
                engine
                    .ingest(&source, &text(&format!("Delivery penalty clause number {}.", i)))
                    .await
                    .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let hits = engine
                        .search("delivery penalty", 5, SearchMode::Hybrid, None)
                        .await
                        .unwrap();
                    assert!(!hits.is_empty());
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    let stats = engine.stats().await;
    assert_eq!((stats.documents, stats.chunks), (21, 21));
    assert!(stats.built);
}

#[test]
fn test_mutation_requires_rebuild() {
    let mut index = HybridIndex::new(IndexParams::default());
    let chunks = build_chunks("a", &text("Some words to index."), 1, 10);
    let vectors = vec![Vec::new(); chunks.len()];
    index.add_document("a", chunks, vectors).unwrap();

    assert!(matches!(index.search_lexical("words", 3), Err(EngineError::IndexNotBuilt)));
    index.rebuild();
    assert_eq!(index.search_lexical("words", 3).unwrap().len(), 1);
}

#[tokio::test]
async fn test_vector_search_finds_similar_document() {
    let engine = engine_with(Arc::new(HashEmbedder::default()));
    load_contracts(&engine).await;
    let hits = engine
        .search("sunny weather tomorrow afternoon", 1, SearchMode::Vector, None)
        .await
        .unwrap();
    assert_eq!(hits[0].chunk.source, "weather");
}

#[tokio::test]
async fn test_conflicting_sources_are_set_aside() {
    let generator = Arc::new(RecordingGenerator::default());
    let engine = engine_with(Arc::new(HashEmbedder::default()))
        .with_reranker(Arc::new(KeywordReranker))
        .with_conflict_scorer(Arc::new(DeadlineConflicts))
        .with_generator(generator.clone());
    load_contracts(&engine).await;

    let chat = vec![
        ChatMessage::new("user", "Hello"),
        ChatMessage::new("assistant", "Hi, ask about your contracts."),
        ChatMessage::new("user", "What is the late delivery penalty?"),
    ];
    let answer = engine.answer(&chat).await.unwrap();

    assert!(answer.conflicts.has_conflicts());
    assert_eq!(answer.conflicts.groups.len(), 2);
    assert_eq!(answer.files_used.len(), 1);
    assert_eq!(answer.set_aside.len(), 1);

    let mut all: Vec<String> = answer.files_used.iter().chain(&answer.set_aside).cloned().collect();
    all.sort();
    assert_eq!(all, vec!["supplier-a", "supplier-b"]);
    assert!(!answer.context.contains("Sunny"));

    let seen = generator.seen.lock().unwrap();
    let (history, question, context, attention) = &seen[0];
    assert_eq!(*history, 2);
    assert_eq!(question, "What is the late delivery penalty?");
    assert_eq!(context, &answer.context);
    assert!(attention.as_deref().unwrap_or_default().contains(&answer.set_aside[0]));
    assert_eq!(answer.answer.as_deref(), Some("Ten or thirty days, the sources disagree."));
}

#[tokio::test]
async fn test_consistent_sources_stay_together() {
    let engine = engine_with(Arc::new(HashEmbedder::default()))
        .with_reranker(Arc::new(KeywordReranker))
        .with_conflict_scorer(Arc::new(DeadlineConflicts));
    engine
        .ingest("a", &text("The penalty is due after ten days."))
        .await
        .unwrap();
    engine
        .ingest("b", &text("Invoices list the penalty after ten days."))
        .await
        .unwrap();

    let answer = engine
        .answer(&[ChatMessage::new("user", "penalty days")])
        .await
        .unwrap();
    assert!(!answer.conflicts.has_conflicts());
    assert_eq!(answer.files_used.len(), 2);
    assert!(answer.set_aside.is_empty());
    assert!(answer.answer.is_none());
}

#[tokio::test]
async fn test_snapshot_reloads_through_config() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("data").join("index.json");
    let config = parse_config(&format!(
        "[index]\npath = \"{}\"\n\n[lexical]\nlanguage = \"english\"\n",
        index_path.display()
    ))
    .unwrap();

    let engine = Engine::from_config(&config).unwrap();
    load_contracts(&engine).await;
    engine.remove("weather").await.unwrap();
    assert!(index_path.exists());
    let before = engine.search("delivery penalty", 5, SearchMode::Hybrid, None).await.unwrap();

    let reloaded = Engine::from_config(&config).unwrap();
    let mut sources = reloaded.sources().await;
    sources.sort();
    assert_eq!(
        sources,
        vec![("supplier-a".to_string(), 1), ("supplier-b".to_string(), 1)]
    );
    let after = reloaded.search("delivery penalty", 5, SearchMode::Hybrid, None).await.unwrap();
    let ids = |hits: &[evidence_harness::models::ScoredChunk]| -> Vec<String> {
        hits.iter().map(|h| h.chunk.chunk_hash.clone()).collect()
    };
    assert_eq!(ids(&before), ids(&after));
}

#[tokio::test]
async fn test_three_hundred_tokens_end_to_end() {
    let engine = engine_with(Arc::new(HashEmbedder::default()));
    let body: String = (0..30)
        .map(|i| {
            let topic = if i == 27 { "zeppelin" } else { "routine" };
            format!("Sentence number {} talks about {} matters in plain words.", i, topic)
        })
        .collect::<Vec<_>>()
        .join(" ");

    let report = engine.ingest("long", &text(&body)).await.unwrap();
    assert_eq!(report.tokens, 300);
    assert_eq!(report.chunks, 3);
    for chunk in engine.chunks_for("long").await {
        assert!((50..=120).contains(&chunk.chunk_size), "size {}", chunk.chunk_size);
    }

    let hits = engine
        .search("zeppelin", 3, SearchMode::Hybrid, Some(0.0))
        .await
        .unwrap();
    assert_eq!(hits[0].chunk.chunk_id, 2);
}
