//! Configuration for the retrieval pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notes_embeddings::{
    EmbeddingProvider, HashProvider, OpenAIProvider, ResilientProvider, RetryPolicy,
    SelfMatchPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RetrievalError};

/// Configuration for the retrieval pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Path of the SQLite embedding cache.
    pub database_path: PathBuf,

    /// Fixed embedding dimension for this installation, if enforced.
    pub dimension: Option<usize>,

    /// Embedding provider configuration.
    pub provider: ProviderConfig,

    /// Cache population configuration.
    pub populate: PopulateConfig,

    /// Query processing configuration.
    pub query: QueryConfig,
}

impl RetrievalConfig {
    /// Create a new configuration with default values.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            dimension: None,
            provider: ProviderConfig::default(),
            populate: PopulateConfig::default(),
            query: QueryConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration from `path`, or use defaults when it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.query.neighbors == 0 {
            return Err(RetrievalError::Config(
                "query.neighbors must be at least 1".to_string(),
            ));
        }
        if self.populate.concurrency == 0 {
            return Err(RetrievalError::Config(
                "populate.concurrency must be at least 1".to_string(),
            ));
        }
        if self.dimension == Some(0) {
            return Err(RetrievalError::Config(
                "dimension must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Enforce a fixed embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Set the provider configuration.
    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        self.provider = config;
        self
    }

    /// Set the query configuration.
    pub fn with_query(mut self, config: QueryConfig) -> Self {
        self.query = config;
        self
    }

    /// Set how many sections are embedded concurrently.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.populate.concurrency = concurrency;
        self
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self::new(
            dirs::data_dir()
                .unwrap_or_default()
                .join("notes/embeddings.db"),
        )
    }
}

/// Type of embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Deterministic offline hash embeddings.
    Hash,
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Which provider to use.
    pub kind: ProviderKind,

    /// Model to request (provider default when unset).
    pub model: Option<String>,

    /// API base URL override.
    pub base_url: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Vector length for the hash provider when no dimension is configured.
    pub hash_dimension: usize,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,

    /// Retries after a failed call.
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Cap on the delay between retries, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAI,
            model: None,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            hash_dimension: 256,
            timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    /// Timeout and retry settings for provider calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// Construct the configured provider wrapped with timeout and retry.
    pub fn build(&self, dimension: Option<usize>) -> Result<Arc<dyn EmbeddingProvider>> {
        let policy = self.retry_policy();
        let provider: Arc<dyn EmbeddingProvider> = match self.kind {
            ProviderKind::OpenAI => {
                let mut provider = OpenAIProvider::from_env(&self.api_key_env);
                if let Some(model) = &self.model {
                    provider = provider.with_model(model);
                }
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url);
                }
                if let Some(dims) = dimension {
                    provider = provider.with_dimensions(dims);
                }
                if !provider.is_available() {
                    return Err(RetrievalError::Config(format!(
                        "OpenAI provider needs an API key in ${}",
                        self.api_key_env
                    )));
                }
                Arc::new(ResilientProvider::new(provider, policy))
            }
            ProviderKind::Hash => Arc::new(ResilientProvider::new(
                HashProvider::new(dimension.unwrap_or(self.hash_dimension)),
                policy,
            )),
        };
        Ok(provider)
    }
}

/// Configuration for cache population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulateConfig {
    /// Sections embedded at once; 1 keeps population strictly sequential.
    pub concurrency: usize,
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Configuration for query processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Neighbors requested per query row.
    pub neighbors: usize,

    /// How self-matches are dropped from each row.
    pub self_match: SelfMatchPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            neighbors: 10,
            self_match: SelfMatchPolicy::SkipSameId,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RetrievalConfig::new("/tmp/cache.db");
        assert_eq!(config.query.neighbors, 10);
        assert_eq!(config.query.self_match, SelfMatchPolicy::SkipSameId);
        assert_eq!(config.populate.concurrency, 1);
        assert_eq!(config.provider.kind, ProviderKind::OpenAI);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: RetrievalConfig = toml::from_str(
            r#"
            database_path = "notes.db"
            dimension = 3

            [provider]
            kind = "hash"
            max_retries = 0

            [query]
            neighbors = 4
            self_match = "skip_zero_distance"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("notes.db"));
        assert_eq!(config.dimension, Some(3));
        assert_eq!(config.provider.kind, ProviderKind::Hash);
        assert_eq!(config.provider.max_retries, 0);
        assert_eq!(config.provider.timeout_secs, 30);
        assert_eq!(config.query.neighbors, 4);
        assert_eq!(config.query.self_match, SelfMatchPolicy::SkipZeroDistance);
        assert_eq!(config.populate.concurrency, 1);
    }

    #[test]
    fn test_load_rejects_zero_neighbors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[query]\nneighbors = 0\n").unwrap();

        let err = RetrievalConfig::load(&path).unwrap_err();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = RetrievalConfig::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, RetrievalConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "query = [").unwrap();
        assert!(matches!(
            RetrievalConfig::load(&path),
            Err(RetrievalError::TomlParse(_))
        ));
    }

    #[test]
    fn test_openai_requires_key() {
        let provider = ProviderConfig {
            api_key_env: "NOTES_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            provider.build(None),
            Err(RetrievalError::Config(_))
        ));
    }

    #[test]
    fn test_hash_provider_uses_configured_dimension() {
        let provider = ProviderConfig {
            kind: ProviderKind::Hash,
            ..ProviderConfig::default()
        };
        assert_eq!(provider.build(Some(12)).unwrap().dimension(), 12);
        assert_eq!(provider.build(None).unwrap().dimension(), 256);
    }

    #[test]
    fn test_openai_dimension_only_for_shortening_models() {
        // Any variable that is set serves as the key; nothing is sent.
        let config = |model: &str| ProviderConfig {
            model: Some(model.to_string()),
            api_key_env: "PATH".to_string(),
            ..ProviderConfig::default()
        };

        let shortened = config("text-embedding-3-small").build(Some(256)).unwrap();
        assert_eq!(shortened.dimension(), 256);

        let legacy = config("text-embedding-ada-002").build(Some(256)).unwrap();
        assert_eq!(legacy.dimension(), 1536);
    }

    #[test]
    fn test_retry_policy() {
        let policy = ProviderConfig::default().retry_policy();
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
    }
}
