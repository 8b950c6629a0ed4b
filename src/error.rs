//! Error types for the knowledge-base layer.

use std::time::Duration;

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors raised when chunking options are malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("{field} must be greater than zero")]
    ZeroSize { field: &'static str },

    #[error("min_chunk_size ({min}) must not exceed chunk_size ({chunk})")]
    MinExceedsTarget { min: usize, chunk: usize },

    #[error("chunk_size ({chunk}) must not exceed max_chunk_size ({max})")]
    TargetExceedsMax { chunk: usize, max: usize },

    #[error("overlap_size ({overlap}) must be less than chunk_size ({chunk})")]
    OverlapTooLarge { overlap: usize, chunk: usize },
}

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding server: {0}")]
    ConnectionError(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding model error: {0}")]
    ModelError(String),

    #[error("embedding provider failed: {0}")]
    ProviderError(String),

    #[error("embedding timeout")]
    Timeout,
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::ConnectionError(_) | EmbeddingError::Timeout => true,
            // Server errors might be transient (e.g., 503 Service Unavailable)
            EmbeddingError::ServerError(msg) => {
                msg.contains("503")
                    || msg.contains("502")
                    || msg.contains("504")
                    || msg.contains("429")
                    || msg.to_lowercase().contains("unavailable")
                    || msg.to_lowercase().contains("too many requests")
            }
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::InvalidResponse(_)
            | EmbeddingError::ModelError(_)
            | EmbeddingError::ProviderError(_) => false,
        }
    }
}

/// Errors related to vector store operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("failed to connect to vector store: {0}")]
    ConnectionError(String),

    #[error("vector store request timed out")]
    Timeout,

    #[error("vector store returned status {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid vector store response: {0}")]
    InvalidResponse(String),

    #[error("vector store client error: {0}")]
    ClientError(String),

    #[error("vector store unavailable after {attempts} attempt(s): {last_error}")]
    StoreUnavailable { attempts: u32, last_error: String },

    #[error("circuit breaker open, retry in {}ms", retry_after.as_millis())]
    CircuitOpen { retry_after: Duration },

    #[error("collection handle missing after initialization: {0}")]
    CollectionNotInitialized(String),
}

impl VectorStoreError {
    /// Whether this error means the remote store could not be reached at all.
    ///
    /// `CircuitOpen` is treated like `StoreUnavailable` by callers.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            VectorStoreError::StoreUnavailable { .. } | VectorStoreError::CircuitOpen { .. }
        )
    }
}

impl Retryable for VectorStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            VectorStoreError::ConnectionError(_) | VectorStoreError::Timeout => true,
            VectorStoreError::ServerError { status, .. } => *status >= 500 || *status == 429,
            VectorStoreError::ClientError(msg) => {
                let msg_lower = msg.to_lowercase();
                msg_lower.contains("timeout")
                    || msg_lower.contains("connection")
                    || msg_lower.contains("unavailable")
                    || msg_lower.contains("too many")
            }
            VectorStoreError::CollectionNotFound(_)
            | VectorStoreError::InvalidRequest(_)
            | VectorStoreError::InvalidResponse(_)
            | VectorStoreError::StoreUnavailable { .. }
            | VectorStoreError::CircuitOpen { .. }
            | VectorStoreError::CollectionNotInitialized(_) => false,
        }
    }
}

/// Errors raised by a keyword index collaborator.
#[derive(Debug, Error)]
pub enum KeywordIndexError {
    #[error("keyword index unavailable: {0}")]
    Unavailable(String),

    #[error("keyword query failed: {0}")]
    QueryError(String),
}

/// Errors surfaced by the knowledge-base service.
#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid chunking options: {0}")]
    Chunking(#[from] ChunkError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("keyword index error: {0}")]
    KeywordIndex(#[from] KeywordIndexError),

    #[error("processing of document {0} was cancelled")]
    Cancelled(String),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_store_retryable_classification() {
        assert!(VectorStoreError::ConnectionError("refused".into()).is_retryable());
        assert!(VectorStoreError::Timeout.is_retryable());
        assert!(
            VectorStoreError::ServerError {
                status: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert!(
            !VectorStoreError::ServerError {
                status: 400,
                message: "bad".into()
            }
            .is_retryable()
        );
        assert!(!VectorStoreError::CollectionNotFound("kb_x".into()).is_retryable());
        assert!(
            !VectorStoreError::StoreUnavailable {
                attempts: 3,
                last_error: "x".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_unavailable_covers_circuit_open() {
        let open = VectorStoreError::CircuitOpen {
            retry_after: Duration::from_secs(1),
        };
        assert!(open.is_unavailable());
        assert!(!VectorStoreError::Timeout.is_unavailable());
    }

    #[test]
    fn test_embedding_server_error_retryable() {
        assert!(EmbeddingError::ServerError("status 503: overloaded".into()).is_retryable());
        assert!(!EmbeddingError::ServerError("status 400: bad input".into()).is_retryable());
        assert!(!EmbeddingError::InvalidResponse("empty".into()).is_retryable());
    }
}
