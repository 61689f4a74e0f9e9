//! Reranking pipeline: scores expanded candidates against the question with
//! a cross-encoder and keeps the best `k` above a threshold.
//!
//! ```text
//! candidates ──► (question, joined texts) pairs ──► one batched score call
//!            ──► drop score < threshold ──► stable sort desc ──► first k
//! ```
//!
//! Without a reranker the first `k` candidates pass through unscored, in
//! retrieval order.
//!
//! Providers:
//! - [`HttpReranker`]: Jina/Cohere-style `POST /rerank` APIs
//!   (`{"results": [{"index", "relevance_score"}]}`), also the bare-array
//!   form served by text-embeddings-inference.
//! - `LocalReranker`: fastembed `TextRerank` cross-encoder (feature `local-models`).

use anyhow::bail;
use async_trait::async_trait;

use crate::config::RerankConfig;
use crate::error::{EngineError, Result};
use crate::http;
use crate::models::{ExpandedCandidate, RankedGroup};

const ORACLE: &str = "rerank";

/// Relevance oracle over `(query, text)` pairs.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// One score per text, in input order. Higher is more relevant.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

/// Run the reranking stage over expanded candidates.
pub async fn select(
    reranker: Option<&dyn Reranker>,
    question: &str,
    candidates: Vec<ExpandedCandidate>,
    k: usize,
    threshold: f32,
) -> Result<Vec<RankedGroup>> {
    let reranker = match reranker {
        Some(r) if !candidates.is_empty() => r,
        _ => {
            return Ok(candidates
                .into_iter()
                .take(k)
                .map(RankedGroup::from)
                .collect())
        }
    };

    let texts: Vec<String> = candidates.iter().map(|c| c.texts.join(" ")).collect();
    let scores = reranker.score(question, &texts).await?;
    if scores.len() != candidates.len() {
        return Err(EngineError::oracle(
            ORACLE,
            format!(
                "{} returned {} scores for {} candidates",
                reranker.name(),
                scores.len(),
                candidates.len()
            ),
        ));
    }

    let mut ranked: Vec<RankedGroup> = candidates
        .into_iter()
        .zip(scores)
        .filter(|(_, score)| *score >= threshold)
        .map(|(c, score)| RankedGroup {
            score: Some(score),
            ..RankedGroup::from(c)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(k);

    tracing::debug!(
        reranker = reranker.name(),
        kept = ranked.len(),
        threshold,
        "reranked candidates"
    );
    Ok(ranked)
}

// ============ HTTP ============

/// Reranker calling a hosted rerank endpoint.
pub struct HttpReranker {
    url: String,
    model: Option<String>,
    api_key: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.url required for http provider"))?;
        Ok(Self {
            url,
            model: config.model.clone(),
            api_key: http::api_key(config.api_key_env.as_deref())?,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        self.model.as_deref().unwrap_or("http")
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let mut body = serde_json::json!({
            "query": query,
            "documents": texts,
            "texts": texts,
            "top_n": texts.len(),
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::json!(model);
        }
        let json = http::post_json(
            &self.client,
            "Rerank",
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await
        .map_err(|e| EngineError::oracle(ORACLE, e))?;
        parse_rerank_response(&json, texts.len()).map_err(|e| EngineError::oracle(ORACLE, e))
    }
}

/// Scatter `{index, relevance_score|score}` results back into input order.
fn parse_rerank_response(json: &serde_json::Value, n: usize) -> anyhow::Result<Vec<f32>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .or_else(|| json.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing results array"))?;

    let mut scores: Vec<Option<f32>> = vec![None; n];
    for item in results {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing index"))?
            as usize;
        let score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|s| s.as_f64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing score"))?;
        match scores.get_mut(index) {
            Some(slot) => *slot = Some(score as f32),
            None => bail!("Invalid rerank response: index {} out of range", index),
        }
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("Invalid rerank response: no score for {}", i)))
        .collect()
}

// ============ Local (fastembed) ============

/// Cross-encoder reranker running in-process via fastembed.
///
/// Raw logits are squashed with a sigmoid so thresholds stay in `[0, 1]`.
#[cfg(feature = "local-models")]
pub struct LocalReranker {
    model_name: String,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextRerank>>>,
}

#[cfg(feature = "local-models")]
impl LocalReranker {
    pub fn new(config: &RerankConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-reranker-v2-m3".to_string());
        fastembed_reranker(&model_name)?;
        Ok(Self {
            model_name,
            model: Default::default(),
        })
    }
}

#[cfg(feature = "local-models")]
fn fastembed_reranker(name: &str) -> anyhow::Result<fastembed::RerankerModel> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        other => bail!(
            "Unknown local reranker model: '{}'. Supported models: \
             bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en",
            other
        ),
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Reranker for LocalReranker {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let slot = self.model.clone();
        let name = self.model_name.clone();
        let query = query.to_string();
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<f32>> {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow::anyhow!("local reranker lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextRerank::try_new(
                    fastembed::RerankInitOptions::new(fastembed_reranker(&name)?)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local reranker: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local reranker not loaded"))?;
            let documents: Vec<&str> = texts.iter().map(String::as_str).collect();
            let results = model
                .rerank(query.as_str(), documents, false, None)
                .map_err(|e| anyhow::anyhow!("Local rerank failed: {}", e))?;

            let mut scores = vec![0.0f32; texts.len()];
            for r in results {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = 1.0 / (1.0 + (-r.score).exp());
                }
            }
            Ok(scores)
        })
        .await
        .map_err(|e| EngineError::oracle(ORACLE, e))?
        .map_err(|e| EngineError::oracle(ORACLE, e))
    }
}

/// Create the reranker named by `rerank.provider`; `None` when disabled.
pub fn create_reranker(config: &RerankConfig) -> anyhow::Result<Option<Box<dyn Reranker>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Box::new(HttpReranker::new(config)?))),
        #[cfg(feature = "local-models")]
        "local" => Ok(Some(Box::new(LocalReranker::new(config)?))),
        #[cfg(not(feature = "local-models"))]
        "local" => bail!("Local reranker requires --features local-models"),
        other => bail!("Unknown rerank provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores each text by its position in a fixed list.
    struct FixedScores(Vec<f32>);

    #[async_trait]
    impl Reranker for FixedScores {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl Reranker for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
            Err(EngineError::oracle(ORACLE, "model offline"))
        }
    }

    fn candidate(source: &str, id: usize) -> ExpandedCandidate {
        ExpandedCandidate {
            source: source.to_string(),
            chunk_ids: vec![id],
            texts: vec![format!("{} text {}", source, id)],
            retrieval_score: 0.0,
        }
    }

    fn candidates() -> Vec<ExpandedCandidate> {
        vec![
            candidate("a", 0),
            candidate("b", 0),
            candidate("c", 0),
            candidate("d", 0),
        ]
    }

    fn sources(groups: &[RankedGroup]) -> Vec<&str> {
        groups.iter().map(|g| g.source.as_str()).collect()
    }

    #[tokio::test]
    async fn test_without_reranker_keeps_retrieval_order() {
        let groups = select(None, "q", candidates(), 2, 0.35).await.unwrap();
        assert_eq!(sources(&groups), vec!["a", "b"]);
        assert!(groups.iter().all(|g| g.score.is_none()));
    }

    #[tokio::test]
    async fn test_threshold_sort_and_truncate() {
        let reranker = FixedScores(vec![0.2, 0.9, 0.5, 0.7]);
        let groups = select(Some(&reranker), "q", candidates(), 2, 0.35)
            .await
            .unwrap();
        assert_eq!(sources(&groups), vec!["b", "d"]);
        assert_eq!(groups[0].score, Some(0.9));
    }

    #[tokio::test]
    async fn test_all_below_threshold_is_empty() {
        let reranker = FixedScores(vec![0.1, 0.1, 0.1, 0.1]);
        let groups = select(Some(&reranker), "q", candidates(), 5, 0.35)
            .await
            .unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn test_ties_keep_retrieval_order() {
        let reranker = FixedScores(vec![0.5, 0.8, 0.5, 0.8]);
        let groups = select(Some(&reranker), "q", candidates(), 4, 0.0)
            .await
            .unwrap();
        assert_eq!(sources(&groups), vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_oracle() {
        let groups = select(Some(&Failing), "q", Vec::new(), 5, 0.35)
            .await
            .unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn test_oracle_failure_propagates() {
        let err = select(Some(&Failing), "q", candidates(), 5, 0.35)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OracleUnavailable { oracle: "rerank", .. }));
    }

    #[tokio::test]
    async fn test_score_count_mismatch() {
        let reranker = FixedScores(vec![0.9]);
        let err = select(Some(&reranker), "q", candidates(), 5, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OracleUnavailable { .. }));
    }

    #[test]
    fn test_parse_rerank_response_formats() {
        let jina = serde_json::json!({"results": [
            {"index": 1, "relevance_score": 0.8},
            {"index": 0, "relevance_score": 0.1}
        ]});
        assert_eq!(parse_rerank_response(&jina, 2).unwrap(), vec![0.1, 0.8]);

        let tei = serde_json::json!([{"index": 0, "score": 0.5}]);
        assert_eq!(parse_rerank_response(&tei, 1).unwrap(), vec![0.5]);

        let partial = serde_json::json!({"results": [{"index": 0, "relevance_score": 0.5}]});
        assert!(parse_rerank_response(&partial, 2).is_err());
    }

    #[test]
    fn test_disabled_provider_is_none() {
        assert!(create_reranker(&RerankConfig::default()).unwrap().is_none());
    }
}
