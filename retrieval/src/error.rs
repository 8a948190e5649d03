//! Error types for the retrieval pipeline.

use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval pipeline.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Embedding, cache or index error.
    #[error("embedding error: {0}")]
    Embedding(#[from] notes_embeddings::EmbeddingError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// No section covers the requested document offset.
    #[error("no section at byte offset {offset}")]
    NoSection { offset: usize },

    /// Section header pattern failed to compile.
    #[error("invalid header pattern: {0}")]
    Pattern(#[from] regex_lite::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    /// Whether the run failed because an embedding could not be computed.
    pub fn is_provider_error(&self) -> bool {
        matches!(self, Self::Embedding(e) if e.is_provider_error())
    }
}
