//! TOML configuration.
//!
//! Every section is optional; an empty file yields [`Config::default`], an
//! in-memory index with the lexical side only (embedding `disabled`).
//!
//! ```toml
//! [index]
//! path = "./data/index.json"
//!
//! [chunking]
//! min_tokens = 50
//! max_tokens = 120
//!
//! [retrieval]
//! hybrid_alpha = 0.8
//! candidate_k = 20
//! context_neighbors = 1
//!
//! [lexical]
//! language = "russian"
//! k1 = 1.5
//! b = 0.1
//! delta = 0.5
//!
//! [embedding]
//! provider = "openai"          # disabled | openai | ollama | local
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [rerank]
//! provider = "http"            # disabled | http | local
//! url = "https://api.jina.ai/v1/rerank"
//! model = "jina-reranker-v2-base-multilingual"
//! api_key_env = "JINA_API_KEY"
//! top_k = 5
//! threshold = 0.35
//!
//! [conflict]
//! provider = "http"            # disabled | http
//! url = "https://api-inference.huggingface.co/models/cointegrated/rubert-base-cased-nli-threeway"
//! api_key_env = "HF_API_TOKEN"
//! threshold = 0.5
//! aggregation = "concatenate"  # concatenate | max | mean
//!
//! [generation]
//! provider = "openai"          # disabled | openai
//! model = "gpt-4o-mini"
//!
//! [server]
//! bind = "127.0.0.1:3001"
//!
//! [sync]
//! root = "./docs"
//! include_globs = ["**/*.docx", "**/*.pdf"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::{DEFAULT_MAX_TOKENS, DEFAULT_MIN_TOKENS};
use crate::conflict::Aggregation;
use crate::index::IndexParams;
use crate::lexical::{Bm25Params, StemLanguage};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub lexical: LexicalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    /// Snapshot file. `None` keeps the index in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: DEFAULT_MIN_TOKENS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

fn default_min_tokens() -> usize {
    DEFAULT_MIN_TOKENS
}
fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of cosine similarity; `1 - alpha` goes to BM25.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    /// Chunks retrieved before context expansion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Neighbours added on each side of a retrieved chunk.
    #[serde(default = "default_context_neighbors")]
    pub context_neighbors: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            context_neighbors: default_context_neighbors(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.8
}
fn default_candidate_k() -> usize {
    20
}
fn default_context_neighbors() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LexicalConfig {
    #[serde(default)]
    pub language: StemLanguage,
    #[serde(flatten)]
    pub bm25: Bm25Params,
}

impl LexicalConfig {
    pub fn index_params(&self) -> IndexParams {
        IndexParams {
            bm25: self.bm25,
            language: self.language,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL; used by `ollama` and OpenAI-compatible endpoints.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_threshold")]
    pub threshold: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: None,
            top_k: default_rerank_top_k(),
            threshold: default_rerank_threshold(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_top_k() -> usize {
    5
}
fn default_rerank_threshold() -> f32 {
    0.35
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConflictConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Label whose probability is read as the contradiction score.
    #[serde(default = "default_conflict_label")]
    pub label: String,
    #[serde(default = "default_conflict_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            api_key_env: None,
            label: default_conflict_label(),
            threshold: default_conflict_threshold(),
            aggregation: Aggregation::default(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_conflict_label() -> String {
    "contradiction".to_string()
}
fn default_conflict_threshold() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of an OpenAI-compatible API (`/v1` is appended).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Replaces the built-in answer-only-from-context instruction.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Merge evidence groups of one source into a single group, ordered by
    /// chunk id without repeats, before building the context.
    #[serde(default)]
    pub merge_sources: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: default_api_key_env(),
            temperature: None,
            system_prompt: None,
            merge_sources: false,
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}
fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3001".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    crate::extract::SUPPORTED_EXTENSIONS
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

/// Starter configuration written by `evh init`.
pub const SAMPLE_CONFIG: &str = r#"[index]
path = "./data/index.json"

[chunking]
min_tokens = 50
max_tokens = 120

[retrieval]
hybrid_alpha = 0.8
candidate_k = 20
context_neighbors = 1

[lexical]
language = "russian"

[embedding]
provider = "disabled"
# provider = "openai"
# model = "text-embedding-3-small"
# dims = 1536

[rerank]
provider = "disabled"
top_k = 5
threshold = 0.35

[conflict]
provider = "disabled"
threshold = 0.5

[generation]
provider = "disabled"

[server]
bind = "127.0.0.1:3001"

[sync]
root = "./docs"
"#;

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.min_tokens == 0 {
        bail!("chunking.min_tokens must be > 0");
    }
    if config.chunking.max_tokens < config.chunking.min_tokens {
        bail!("chunking.max_tokens must be >= chunking.min_tokens");
    }

    // Retrieval
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.candidate_k == 0 {
        bail!("retrieval.candidate_k must be >= 1");
    }

    // Lexical
    let bm25 = &config.lexical.bm25;
    if bm25.k1 < 0.0 || !(0.0..=1.0).contains(&bm25.b) || bm25.delta < 0.0 {
        bail!("lexical: k1 and delta must be >= 0, b must be in [0.0, 1.0]");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Rerank
    if config.rerank.top_k == 0 {
        bail!("rerank.top_k must be >= 1");
    }
    match config.rerank.provider.as_str() {
        "disabled" | "local" => {}
        "http" => {
            if config.rerank.url.is_none() {
                bail!("rerank.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }

    // Conflict
    if !(0.0..=1.0).contains(&config.conflict.threshold) {
        bail!("conflict.threshold must be in [0.0, 1.0]");
    }
    match config.conflict.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.conflict.url.is_none() {
                bail!("conflict.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown conflict provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    // Generation
    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.generation.model.is_none() {
                bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
