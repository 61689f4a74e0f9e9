//! Conflict grouping: partitions the sources of a retrieved set into
//! groups with no contradicting pair inside a group.
//!
//! For every unordered pair of sources an NLI model scores how strongly
//! one contradicts the other. Pairs at or above the threshold become edges
//! of a per-query conflict graph, and sources are placed first-fit into
//! the first group holding none of their conflicting neighbours. First-fit
//! is an approximation of graph coloring; it does not minimize the number
//! of groups. Sources are visited in first-encountered (rank) order.
//!
//! | Aggregation | Texts scored per source pair |
//! |-------------|------------------------------|
//! | `concatenate` | one call on each source's texts joined |
//! | `max` | every text pair, highest score |
//! | `mean` | every text pair, average score |

use std::collections::HashSet;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConflictConfig;
use crate::error::{EngineError, Result};
use crate::http;
use crate::models::RankedGroup;

const ORACLE: &str = "conflict";

/// Contradiction oracle over ordered text pairs.
#[async_trait]
pub trait ConflictScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Probability in `[0, 1]` that `b` contradicts `a`.
    async fn contradiction(&self, a: &str, b: &str) -> Result<f32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Concatenate,
    Max,
    Mean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEdge {
    pub a: String,
    pub b: String,
    pub score: f32,
}

/// Outcome of conflict analysis for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Distinct sources in first-encountered order.
    pub sources: Vec<String>,
    /// Symmetric aggregated scores, indexed like `sources`.
    pub matrix: Vec<Vec<f32>>,
    pub edges: Vec<ConflictEdge>,
    pub groups: Vec<Vec<String>>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.edges.is_empty()
    }
}

/// Texts of each source, in first-encountered order.
fn texts_by_source(groups: &[RankedGroup]) -> Vec<(String, Vec<String>)> {
    let mut out: Vec<(String, Vec<String>)> = Vec::new();
    for g in groups {
        let text = g.joined_text();
        match out.iter_mut().find(|(s, _)| *s == g.source) {
            Some((_, texts)) => texts.push(text),
            None => out.push((g.source.clone(), vec![text])),
        }
    }
    out
}

async fn pair_score(
    scorer: &dyn ConflictScorer,
    a: &[String],
    b: &[String],
    aggregation: Aggregation,
) -> Result<f32> {
    if aggregation == Aggregation::Concatenate {
        return scorer.contradiction(&a.join(" "), &b.join(" ")).await;
    }

    let mut scores = Vec::with_capacity(a.len() * b.len());
    for ta in a {
        for tb in b {
            scores.push(scorer.contradiction(ta, tb).await?);
        }
    }
    if scores.is_empty() {
        return Ok(0.0);
    }
    Ok(match aggregation {
        Aggregation::Max => scores.iter().copied().fold(f32::MIN, f32::max),
        _ => scores.iter().sum::<f32>() / scores.len() as f32,
    })
}

/// Greedy first-fit partition of `sources` so that no group contains both
/// ends of an edge. Every source lands in exactly one group.
pub fn first_fit_groups(sources: &[String], edges: &[ConflictEdge]) -> Vec<Vec<String>> {
    let conflicts: HashSet<(&str, &str)> = edges
        .iter()
        .flat_map(|e| [(e.a.as_str(), e.b.as_str()), (e.b.as_str(), e.a.as_str())])
        .collect();

    let mut groups: Vec<Vec<String>> = Vec::new();
    for source in sources {
        let slot = groups.iter_mut().find(|group| {
            !group
                .iter()
                .any(|member| conflicts.contains(&(source.as_str(), member.as_str())))
        });
        match slot {
            Some(group) => group.push(source.clone()),
            None => groups.push(vec![source.clone()]),
        }
    }
    groups
}

/// Build the conflict report for the reranked groups of one query.
///
/// Without a scorer every source goes into a single group.
pub async fn group_by_source(
    groups: &[RankedGroup],
    scorer: Option<&dyn ConflictScorer>,
    threshold: f32,
    aggregation: Aggregation,
) -> Result<ConflictReport> {
    let docs = texts_by_source(groups);
    let sources: Vec<String> = docs.iter().map(|(s, _)| s.clone()).collect();
    let n = sources.len();
    let mut matrix = vec![vec![0.0f32; n]; n];
    let mut edges = Vec::new();

    if let Some(scorer) = scorer {
        for i in 0..n {
            for j in (i + 1)..n {
                let score = pair_score(scorer, &docs[i].1, &docs[j].1, aggregation).await?;
                matrix[i][j] = score;
                matrix[j][i] = score;
                if score >= threshold {
                    edges.push(ConflictEdge {
                        a: sources[i].clone(),
                        b: sources[j].clone(),
                        score,
                    });
                }
            }
        }
    }

    let partition = first_fit_groups(&sources, &edges);
    if !edges.is_empty() {
        tracing::info!(
            sources = n,
            conflicts = edges.len(),
            groups = partition.len(),
            "conflicting sources found"
        );
    }

    Ok(ConflictReport {
        sources,
        matrix,
        edges,
        groups: partition,
    })
}

/// Split ranked groups along the report's source groups, keeping rank
/// order inside each.
pub fn partition_ranked(groups: Vec<RankedGroup>, report: &ConflictReport) -> Vec<Vec<RankedGroup>> {
    let mut out: Vec<Vec<RankedGroup>> = vec![Vec::new(); report.groups.len()];
    for g in groups {
        if let Some(i) = report.groups.iter().position(|members| members.contains(&g.source)) {
            out[i].push(g);
        }
    }
    out
}

// ============ HTTP (Hugging Face inference) ============

/// NLI classifier behind a Hugging Face-style inference endpoint.
///
/// Sends `{"inputs": {"text": a, "text_pair": b}}` and reads the
/// probability of the configured label (default `contradiction`).
pub struct HttpConflictScorer {
    url: String,
    label: String,
    api_key: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpConflictScorer {
    pub fn new(config: &ConflictConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("conflict.url required for http provider"))?;
        Ok(Self {
            url,
            label: config.label.clone(),
            api_key: http::api_key(config.api_key_env.as_deref())?,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ConflictScorer for HttpConflictScorer {
    fn name(&self) -> &str {
        &self.url
    }

    async fn contradiction(&self, a: &str, b: &str) -> Result<f32> {
        let body = serde_json::json!({
            "inputs": {"text": a, "text_pair": b},
            "parameters": {"top_k": null},
        });
        let json = http::post_json(
            &self.client,
            "NLI",
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await
        .map_err(|e| EngineError::oracle(ORACLE, e))?;
        label_score(&json, &self.label).map_err(|e| EngineError::oracle(ORACLE, e))
    }
}

/// Find `label` in `[{label, score}]` (optionally nested one level).
fn label_score(json: &serde_json::Value, label: &str) -> anyhow::Result<f32> {
    let mut items = json
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid NLI response: expected an array"))?;
    if let Some(inner) = items.first().and_then(|v| v.as_array()) {
        items = inner;
    }
    for item in items {
        let name = item.get("label").and_then(|l| l.as_str()).unwrap_or_default();
        if name.eq_ignore_ascii_case(label) {
            let score = item
                .get("score")
                .and_then(|s| s.as_f64())
                .ok_or_else(|| anyhow::anyhow!("Invalid NLI response: missing score"))?;
            return Ok(score as f32);
        }
    }
    bail!("Invalid NLI response: no '{}' label", label)
}

/// Create the scorer named by `conflict.provider`; `None` when disabled.
pub fn create_conflict_scorer(config: &ConflictConfig) -> anyhow::Result<Option<Box<dyn ConflictScorer>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Box::new(HttpConflictScorer::new(config)?))),
        other => bail!("Unknown conflict provider: {}", other),
    }
}
