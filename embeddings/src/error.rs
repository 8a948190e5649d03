//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// The API answered with a non-success status.
    #[error("API request failed ({status}): {message}")]
    ApiRequest { status: u16, message: String },

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Provider call did not finish within the configured timeout.
    #[error("embedding call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A stored blob could not be decoded.
    #[error("corrupt embedding data: {0}")]
    CorruptData(String),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The text is already cached with a different vector.
    #[error("text already cached with a different embedding: {text:?}")]
    DuplicateKey { text: String },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmbeddingError {
    /// Whether this error came from computing an embedding rather than from
    /// storage or indexing.
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderNotConfigured
                | Self::ApiRequest { .. }
                | Self::InvalidResponse(_)
                | Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Http(_)
        )
    }

    /// Whether retrying the same provider call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            // Server-side failures and request timeouts; other 4xx are permanent.
            Self::ApiRequest { status, .. } => *status >= 500 || *status == 408,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_classification() {
        assert!(EmbeddingError::Timeout { timeout_ms: 10 }.is_provider_error());
        assert!(EmbeddingError::ProviderNotConfigured.is_provider_error());
        assert!(!EmbeddingError::CorruptData("short".into()).is_provider_error());
        assert!(
            !EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
            .is_provider_error()
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EmbeddingError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(EmbeddingError::Timeout { timeout_ms: 5 }.is_retryable());
        assert!(!EmbeddingError::ProviderNotConfigured.is_retryable());
        assert!(!EmbeddingError::InvalidResponse("no data".into()).is_retryable());
    }

    fn api_error(status: u16) -> EmbeddingError {
        EmbeddingError::ApiRequest {
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn test_only_server_side_api_errors_retry() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(408).is_retryable());
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(401).is_retryable());
        assert!(!api_error(404).is_retryable());
        assert!(api_error(401).is_provider_error());
    }
}
