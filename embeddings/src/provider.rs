//! Embedding providers.
//!
//! A provider is a pure function from text to a fixed-dimension vector. It
//! does no caching of its own; see [`crate::cache`] for that.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the model this provider embeds with.
    fn model(&self) -> &str;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;

    /// Generate an embedding for the given text.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generate embeddings for multiple texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool {
        true
    }
}

#[async_trait]
impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for std::sync::Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        (**self).embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        (**self).embed_batch(texts).await
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// OpenAI-compatible embeddings API provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model to request.
    model: String,

    /// Requested output dimensions, if the model supports shortening.
    dimensions: Option<usize>,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider reading the key from `OPENAI_API_KEY`.
    pub fn new() -> Self {
        Self::from_env("OPENAI_API_KEY")
    }

    /// Create a provider reading the API key from the named variable.
    pub fn from_env(var: &str) -> Self {
        Self {
            api_key: std::env::var(var).ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request shortened output vectors. Only `text-embedding-3-*` models
    /// accept this; for other models the setting is ignored.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    fn supports_dimensions(&self) -> bool {
        self.model.starts_with("text-embedding-3")
    }

    fn requested_dimensions(&self) -> Option<usize> {
        self.dimensions.filter(|_| self.supports_dimensions())
    }

    async fn request(&self, input: serde_json::Value) -> Result<OpenAIEmbeddingResponse> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;

        let mut body = serde_json::json!({
            "input": input,
            "model": self.model,
        });
        if let Some(dims) = self.requested_dimensions() {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest { status, message });
        }

        Ok(response.json().await?)
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        if let Some(dims) = self.requested_dimensions() {
            return dims;
        }
        match self.model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        debug!("Generating embedding with model: {}", self.model);

        let result = self.request(serde_json::json!(text)).await?;
        let embedding = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))?
            .embedding;

        debug!("Generated embedding with {} dimensions", embedding.len());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut result = self.request(serde_json::json!(texts)).await?;
        if result.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        result.data.sort_by_key(|item| item.index);
        info!("Generated {} batch embeddings", result.data.len());
        Ok(result.data.into_iter().map(|item| item.embedding).collect())
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f64>,
    index: usize,
}

/// Offline provider deriving a deterministic vector from a SHA-256 digest of
/// the text.
///
/// Equal texts always map to equal vectors and distinct texts almost surely
/// do not; distances carry no semantic meaning.
#[derive(Debug, Clone)]
pub struct HashProvider {
    dimension: usize,
}

impl HashProvider {
    /// Create a hash provider producing vectors of `dimension` elements.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "sha256"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut embedding = Vec::with_capacity(self.dimension);
        let mut block = 0u64;
        while embedding.len() < self.dimension {
            let digest = Sha256::new()
                .chain_update(text.as_bytes())
                .chain_update(block.to_le_bytes())
                .finalize();
            for chunk in digest.chunks_exact(8) {
                if embedding.len() == self.dimension {
                    break;
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                let unit = u64::from_le_bytes(raw) as f64 / u64::MAX as f64;
                embedding.push(unit * 2.0 - 1.0);
            }
            block += 1;
        }
        Ok(embedding)
    }
}

/// Timeout and retry settings for [`ResilientProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound for a single provider call.
    pub timeout: Duration,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further retry.
    pub initial_backoff: Duration,

    /// Cap on the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, retry: u32, error: &EmbeddingError) -> Duration {
        let exponential = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(retry));
        let delay = match error {
            EmbeddingError::RateLimited { retry_after_secs } => {
                exponential.max(Duration::from_secs(*retry_after_secs))
            }
            _ => exponential,
        };
        delay.min(self.max_backoff)
    }
}

/// Wraps a provider with a per-call timeout and retry with exponential
/// backoff.
///
/// Timeouts count as ordinary provider failures. Non-retryable errors are
/// returned immediately.
pub struct ResilientProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: EmbeddingProvider> ResilientProvider<P> {
    /// Wrap `inner` with the given policy.
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Get the wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn attempt(&self, text: &str) -> Result<Embedding> {
        match tokio::time::timeout(self.policy.timeout, self.inner.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Timeout {
                timeout_ms: u64::try_from(self.policy.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for ResilientProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut retry = 0;
        loop {
            match self.attempt(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    let delay = self.policy.backoff(retry, &e);
                    warn!(
                        "Embedding attempt {} via {} failed: {e}; retrying in {delay:?}",
                        retry + 1,
                        self.inner.name()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}
