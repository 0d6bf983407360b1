//! Error taxonomy
//!
//! Mirrors the engine's error-handling design: input errors reject at the
//! API boundary, extraction/LLM errors degrade gracefully in analytical
//! paths, embedding errors bubble to the caller, and storage errors abort
//! the in-flight transaction. See `spec.md` §7 for the full taxonomy.

use thiserror::Error;

/// Storage-layer error
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction aborted: {0}")]
    Aborted(String),
    #[error("initialization error: {0}")]
    Init(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage-layer result alias
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Embedding-provider error
#[non_exhaustive]
#[derive(Debug, Error, Clone)]
pub enum EmbeddingError {
    #[error("embedding provider failed: {0}")]
    Provider(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding call cancelled")]
    Cancelled,
}

/// Vector index error
#[non_exhaustive]
#[derive(Debug, Error, Clone)]
pub enum VectorSearchError {
    #[error("index creation failed: {0}")]
    IndexCreation(String),
    #[error("failed to add vector: {0}")]
    IndexAdd(String),
    #[error("search failed: {0}")]
    IndexSearch(String),
    #[error("invalid dimensions: expected {0}, got {1}")]
    InvalidDimensions(usize, usize),
    #[error("unknown named index: {0}")]
    UnknownIndex(String),
}

/// Fact-extraction error
#[non_exhaustive]
#[derive(Debug, Error, Clone)]
pub enum ExtractionError {
    #[error("llm adapter error: {0}")]
    Adapter(String),
    #[error("malformed extraction output: {0}")]
    MalformedOutput(String),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Top-level engine error, tagged by the taxonomy in `spec.md` §7.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum HindsightError {
    /// Bad bank id, schema violation in options, unknown ids - reject at the API boundary.
    #[error("invalid input: {0}")]
    Input(String),

    /// Adapter failure, malformed JSON, unusable response - the caller degrades gracefully.
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Provider failure or dimension mismatch - bubbles to the caller for retain/recall.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Constraint violation outside conflict-ignore inserts, or I/O error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cancellation signal observed while a call was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Background task failure, swallowed at the task boundary but surfaced here for logging.
    #[error("background task error: {0}")]
    Background(String),
}

impl From<VectorSearchError> for HindsightError {
    fn from(e: VectorSearchError) -> Self {
        HindsightError::Embedding(EmbeddingError::Provider(e.to_string()))
    }
}

/// Top-level engine result alias
pub type Result<T> = std::result::Result<T, HindsightError>;
