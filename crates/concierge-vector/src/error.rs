use thiserror::Error;

use concierge_core::error::ConciergeError;

/// Errors produced by chunking, embedding and retrieval.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VectorError {
    /// A query was made before any document was ingested.
    #[error("The document index is empty")]
    EmptyIndex,

    /// The embedding provider failed or timed out.
    #[error("Embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error(transparent)]
    Storage(#[from] ConciergeError),
}

impl From<reqwest::Error> for VectorError {
    fn from(err: reqwest::Error) -> Self {
        VectorError::EmbeddingUnavailable(err.to_string())
    }
}
