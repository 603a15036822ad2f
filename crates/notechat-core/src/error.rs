//! Error taxonomy for the retrieval core
//!
//! Integrity violations (`DimensionMismatch`, `PersistenceCorrupt`) are fatal and
//! surface immediately. Absence of data (`IndexEmpty`, `NoIndexAvailable`) is a
//! recoverable signal that callers branch on.

use thiserror::Error;

/// Errors produced by the notechat core
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Embedding inference failed: {0}")]
    Inference(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector index is empty")]
    IndexEmpty,

    #[error("No index available; ingest a document first")]
    NoIndexAvailable,

    #[error("Completion model failure: {0}")]
    UpstreamModelFailure(String),

    #[error("Persisted index is corrupt: {0}")]
    PersistenceCorrupt(String),

    #[error("Document parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamModelFailure(_))
    }

    /// Whether this error means "nothing to retrieve yet"
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::IndexEmpty | Self::NoIndexAvailable)
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<candle_core::Error> for RagError {
    fn from(err: candle_core::Error) -> Self {
        Self::Inference(err.to_string())
    }
}

impl From<bincode::Error> for RagError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RagError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, RagError>;
