//! Lexical scoring: tokenizer, stemming and BM25L.
//!
//! The tokenizer lowercases, turns `.` into a separator, keeps only
//! alphanumerics and `-`, splits on whitespace and stems each token with a
//! Snowball stemmer (`rust-stemmers`).
//!
//! Scoring is BM25L:
//!
//! ```text
//! idf(t)    = ln((N + 1) / (df(t) + 0.5))
//! ctd(t, d) = tf(t, d) / (1 - b + b * |d| / avgdl)
//! score     = Σ idf(t) * (k1 + 1) * (ctd + δ) / (k1 + ctd + δ)   over query terms with tf > 0
//! ```
//!
//! Raw scores are min-max rescaled to `[0, 1)` with [`rescale_scores`]
//! before being blended with cosine similarity.

use std::collections::HashMap;

use rust_stemmers::{Algorithm, Stemmer};
use serde::{Deserialize, Serialize};

/// Stemming language for the lexical side of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemLanguage {
    #[default]
    Russian,
    English,
    German,
    French,
    Spanish,
    /// Lowercase and clean only.
    None,
}

impl StemLanguage {
    pub fn algorithm(self) -> Option<Algorithm> {
        match self {
            StemLanguage::Russian => Some(Algorithm::Russian),
            StemLanguage::English => Some(Algorithm::English),
            StemLanguage::German => Some(Algorithm::German),
            StemLanguage::French => Some(Algorithm::French),
            StemLanguage::Spanish => Some(Algorithm::Spanish),
            StemLanguage::None => None,
        }
    }
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokenize `text` into stemmed lexical terms.
pub fn tokenize(text: &str, language: StemLanguage) -> Vec<String> {
    let cleaned: String = normalize_whitespace(text)
        .to_lowercase()
        .chars()
        .map(|c| if c == '.' { ' ' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();

    let stemmer = language.algorithm().map(Stemmer::create);
    cleaned
        .split_whitespace()
        .map(|tok| match &stemmer {
            Some(s) => s.stem(tok).into_owned(),
            None => tok.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    #[serde(default = "default_k1")]
    pub k1: f64,
    #[serde(default = "default_b")]
    pub b: f64,
    #[serde(default = "default_delta")]
    pub delta: f64,
}

fn default_k1() -> f64 {
    1.5
}

fn default_b() -> f64 {
    0.1
}

fn default_delta() -> f64 {
    0.5
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: default_k1(),
            b: default_b(),
            delta: default_delta(),
        }
    }
}

/// BM25L statistics over a tokenized corpus.
#[derive(Debug, Clone)]
pub struct Bm25 {
    params: Bm25Params,
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25 {
    pub fn new<S: AsRef<[String]>>(corpus: &[S], params: Bm25Params) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_lens = Vec::with_capacity(corpus.len());
        let mut df: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let doc = doc.as_ref();
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for term in doc {
                *freqs.entry(term.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lens.push(doc.len());
            doc_freqs.push(freqs);
        }

        let n = corpus.len() as f64;
        let total: usize = doc_lens.iter().sum();
        let avgdl = if corpus.is_empty() {
            0.0
        } else {
            total as f64 / n
        };
        let idf = df
            .into_iter()
            .map(|(term, f)| (term, ((n + 1.0) / (f as f64 + 0.5)).ln()))
            .collect();

        Self {
            params,
            doc_freqs,
            doc_lens,
            avgdl,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    /// Raw BM25L score of every document against `query`, in corpus order.
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let Bm25Params { k1, b, delta } = self.params;
        let avgdl = if self.avgdl > 0.0 { self.avgdl } else { 1.0 };

        self.doc_freqs
            .iter()
            .zip(&self.doc_lens)
            .map(|(freqs, &len)| {
                let norm = 1.0 - b + b * len as f64 / avgdl;
                query
                    .iter()
                    .filter_map(|term| {
                        let tf = *freqs.get(term)? as f64;
                        let idf = self.idf.get(term).copied().unwrap_or(0.0);
                        let ctd = tf / norm;
                        Some(idf * (k1 + 1.0) * (ctd + delta) / (k1 + ctd + delta))
                    })
                    .sum()
            })
            .collect()
    }
}

/// Min-max rescale: `(s - min) / (max - min + 1e-6)`.
///
/// Keeps every value in `[0, 1)` and maps a constant vector to zeros.
pub fn rescale_scores(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| (s - min) / (max - min + 1e-6))
        .collect()
}
