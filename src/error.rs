//! Error taxonomy for the retrieval core.
//!
//! Every fallible operation of the chunker, index, reranking pipeline and
//! conflict grouper returns [`EngineError`]. Application layers (CLI, sync,
//! configuration) wrap these in `anyhow` with added context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A block's `type` is neither `text` nor `table`. Such blocks are
    /// skipped by the block parser; this variant is what gets logged.
    #[error("unsupported block type: {0}")]
    UnsupportedInputType(String),

    #[error("document already indexed: {0}")]
    DuplicateDocument(String),

    #[error("document not found: {0}")]
    UnknownDocument(String),

    /// The index was mutated since the last `rebuild()`.
    #[error("index not built: rebuild required after add/remove")]
    IndexNotBuilt,

    #[error("{oracle} oracle unavailable: {message}")]
    OracleUnavailable {
        oracle: &'static str,
        message: String,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index persistence failed: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Shorthand for an [`EngineError::OracleUnavailable`] with a displayable cause.
    pub fn oracle(oracle: &'static str, message: impl std::fmt::Display) -> Self {
        EngineError::OracleUnavailable {
            oracle,
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_error_message() {
        let err = EngineError::oracle("embedding", "connection refused");
        assert_eq!(
            err.to_string(),
            "embedding oracle unavailable: connection refused"
        );
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Persistence(_)));
    }
}
