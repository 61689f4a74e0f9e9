//! JSON HTTP API over the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST`   | `/documents` | Ingest `{source, blocks}` |
//! | `PUT`    | `/documents/{source}` | Replace a document's blocks |
//! | `DELETE` | `/documents/{source}` | Remove a document |
//! | `GET`    | `/documents` | List sources with chunk counts |
//! | `POST`   | `/search` | Ranked chunks for `{query, k?, alpha?, mode?}` |
//! | `POST`   | `/chat/answer` | Answer the last message of `{chat}` |
//! | `GET`    | `/health` | Status, version and index size |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found: supply-2024" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request`, `duplicate_document`, `dimension_mismatch` | 400 |
//! | `not_found` | 404 |
//! | `oracle_unavailable` | 502 |
//! | `index_not_built` | 503 |
//! | `internal` | 500 |
//!
//! All origins, methods, and headers are permitted (CORS).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::{Answer, Engine, IngestReport, SearchMode};
use crate::error::EngineError;
use crate::models::{parse_blocks, ChatMessage, RawBlock, ScoredChunk};

type AppState = Arc<Engine>;

/// Start the server on `[server].bind` with an engine built from `config`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::from_config(config)?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Evidence server listening on http://{}", config.server.bind);
    serve(listener, engine).await
}

/// Serve the API on an already bound listener until the process exits.
pub async fn serve(listener: tokio::net::TcpListener, engine: Arc<Engine>) -> anyhow::Result<()> {
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_ingest).get(handle_list))
        .route("/documents/{source}", put(handle_replace).delete(handle_remove))
        .route("/search", post(handle_search))
        .route("/chat/answer", post(handle_answer))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match &err {
            EngineError::UnsupportedInputType(_) | EngineError::InvalidArgument(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            EngineError::DuplicateDocument(_) => (StatusCode::BAD_REQUEST, "duplicate_document"),
            EngineError::DimensionMismatch { .. } => (StatusCode::BAD_REQUEST, "dimension_mismatch"),
            EngineError::UnknownDocument(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::OracleUnavailable { .. } => (StatusCode::BAD_GATEWAY, "oracle_unavailable"),
            EngineError::IndexNotBuilt => (StatusCode::SERVICE_UNAVAILABLE, "index_not_built"),
            EngineError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ /documents ============

#[derive(Deserialize)]
struct IngestRequest {
    source: String,
    blocks: Vec<RawBlock>,
}

#[derive(Deserialize)]
struct ReplaceRequest {
    blocks: Vec<RawBlock>,
}

async fn handle_ingest(
    State(engine): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    let blocks = parse_blocks(req.blocks);
    let report = engine.ingest(&req.source, &blocks).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn handle_replace(
    State(engine): State<AppState>,
    Path(source): Path<String>,
    Json(req): Json<ReplaceRequest>,
) -> Result<Json<IngestReport>, AppError> {
    let blocks = parse_blocks(req.blocks);
    Ok(Json(engine.replace(&source, &blocks).await?))
}

#[derive(Serialize)]
struct RemoveResponse {
    source: String,
    chunks_removed: usize,
}

async fn handle_remove(
    State(engine): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<RemoveResponse>, AppError> {
    let chunks_removed = engine.remove(&source).await?;
    Ok(Json(RemoveResponse {
        source,
        chunks_removed,
    }))
}

#[derive(Serialize)]
struct SourceEntry {
    source: String,
    chunks: usize,
}

#[derive(Serialize)]
struct SourcesResponse {
    documents: Vec<SourceEntry>,
}

async fn handle_list(State(engine): State<AppState>) -> Json<SourcesResponse> {
    let documents = engine
        .sources()
        .await
        .into_iter()
        .map(|(source, chunks)| SourceEntry { source, chunks })
        .collect();
    Json(SourcesResponse { documents })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    k: Option<usize>,
    alpha: Option<f64>,
    #[serde(default)]
    mode: SearchMode,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ScoredChunk>,
}

async fn handle_search(
    State(engine): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let k = req.k.unwrap_or(engine.options().candidate_k);
    let results = engine.search(&req.query, k, req.mode, req.alpha).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /chat/answer ============

#[derive(Deserialize)]
struct AnswerRequest {
    chat: Vec<ChatMessage>,
}

async fn handle_answer(
    State(engine): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.chat.is_empty() {
        return Err(bad_request("chat must not be empty"));
    }
    Ok(Json(engine.answer(&req.chat).await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    documents: usize,
    chunks: usize,
}

async fn handle_health(State(engine): State<AppState>) -> Json<HealthResponse> {
    let stats = engine.stats().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        documents: stats.documents,
        chunks: stats.chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (EngineError::DuplicateDocument("a".into()), StatusCode::BAD_REQUEST, "duplicate_document"),
            (EngineError::UnknownDocument("a".into()), StatusCode::NOT_FOUND, "not_found"),
            (EngineError::IndexNotBuilt, StatusCode::SERVICE_UNAVAILABLE, "index_not_built"),
            (EngineError::oracle("rerank", "down"), StatusCode::BAD_GATEWAY, "oracle_unavailable"),
            (EngineError::Persistence("disk".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
        }
    }
}
