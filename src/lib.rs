//! # Evidence Harness
//!
//! Retrieval and consistency engine for question answering over private
//! documents.
//!
//! Documents arrive as ordered text and table blocks, are cut into bounded
//! chunks and held in an in-memory hybrid index (cosine + BM25L). A question
//! retrieves candidates, widens each to its neighbouring chunks, reranks them
//! with a cross-encoder and splits the survivors into groups of mutually
//! consistent sources before an answer is generated.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ extract  │──▶│ chunk + embed│──▶│ HybridIndex       │
//! │ / sync   │   │              │   │ cosine + BM25L    │
//! └──────────┘   └──────────────┘   └─────────┬─────────┘
//!                                             │ top-k, context windows
//!                                             ▼
//!                ┌──────────┐   ┌──────────────────┐   ┌──────────┐
//!                │ generate │◀──│ conflict groups  │◀──│ rerank   │
//!                └──────────┘   └──────────────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Blocks, chunks, hits and ranked groups |
//! | [`chunk`] | Chunk builder |
//! | [`lexical`] | Tokenizer, stemming and BM25L |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Hybrid index and snapshots |
//! | [`rerank`] | Cross-encoder reranking and selection |
//! | [`conflict`] | Contradiction scoring and source grouping |
//! | [`generate`] | Context assembly and answer generation |
//! | [`engine`] | Shared index plus oracles; ingest and answer flows |
//! | [`extract`] | File → blocks |
//! | [`sync`] | Directory scan and bulk ingest |
//! | [`batch`] | CSV questions in, CSV answers out |
//! | [`server`] | JSON HTTP API |

pub mod batch;
pub mod chunk;
pub mod config;
pub mod conflict;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generate;
mod http;
pub mod index;
pub mod lexical;
pub mod logging;
pub mod models;
pub mod rerank;
pub mod server;
pub mod sync;
