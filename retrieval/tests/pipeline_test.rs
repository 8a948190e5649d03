//! Integration tests for the retrieval pipeline.
//!
//! These run the full split → cache → index → query flow against SQLite
//! databases on disk, with a provider that counts its calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notes_embeddings::{EmbeddingCache, EmbeddingError, EmbeddingProvider, HashProvider};
use notes_retrieval::{
    ProviderConfig, ProviderKind, RetrievalConfig, RetrievalError, RetrievalPipeline,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// Deterministic hash-based provider that records every text it embeds.
struct CountingProvider {
    inner: HashProvider,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    fail_on: Option<String>,
    delay: Duration,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            inner: HashProvider::new(8),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            fail_on: None,
            delay: Duration::ZERO,
        }
    }

    fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            ..Self::new()
        }
    }

    fn failing_slowly(text: &str, delay: Duration) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            delay,
            ..Self::new()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    fn model(&self) -> &str {
        "counting"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> notes_embeddings::Result<Vec<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(text.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_on.as_deref() == Some(text) {
            return Err(EmbeddingError::ApiRequest {
                status: 403,
                message: "quota exhausted".to_string(),
            });
        }
        self.inner.embed(text).await
    }
}

async fn pipeline_with(
    dir: &TempDir,
    provider: Arc<CountingProvider>,
    concurrency: usize,
) -> RetrievalPipeline {
    let cache = EmbeddingCache::open(dir.path().join("embeddings.db"))
        .await
        .unwrap();
    RetrievalPipeline::builder()
        .with_cache(Arc::new(cache))
        .with_provider(provider)
        .with_concurrency(concurrency)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_sections_embedded_once_across_runs() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::new());
    let document = "# A\nfoo\n# B\nbar";

    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 1).await;
    let first = pipeline.run(document).await.unwrap();

    let texts: Vec<&str> = first.sections.iter().map(|s| s.text.as_str()).collect();
    assert_eq!(texts, vec!["# A\nfoo\n", "# B\nbar"]);
    assert_eq!(provider.seen(), vec!["# A\nfoo\n", "# B\nbar"]);
    assert_eq!(first.provider_calls, 2);

    let second = pipeline.run(document).await.unwrap();
    assert_eq!(second.provider_calls, 0);

    // A fresh pipeline over the same database file still hits the cache.
    drop(pipeline);
    let reopened = pipeline_with(&dir, Arc::clone(&provider), 1).await;
    let third = reopened.run(document).await.unwrap();

    assert_eq!(third.provider_calls, 0);
    assert_eq!(provider.calls(), 2);
    assert_eq!(third.rows, first.rows);
}

#[tokio::test]
async fn test_pairs_two_sections_with_each_other() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::new());
    let pipeline = pipeline_with(&dir, provider, 1).await;

    let report = pipeline.run("# A\nfoo\n# B\nbar").await.unwrap();

    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.rows[0].text, "# A\nfoo\n");
    assert_eq!(report.rows[0].neighbor_text, "# B\nbar");
    assert_eq!(report.rows[1].neighbor_text, "# A\nfoo\n");
    assert_eq!(report.rows[0].result.distance, report.rows[1].result.distance);
}

#[tokio::test]
async fn test_document_without_headers_calls_nothing() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::new());
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 1).await;

    let report = pipeline.run("plain text\nwithout any heading\n").await.unwrap();

    assert!(report.sections.is_empty());
    assert_eq!(provider.calls(), 0);
    assert!(report.rows.is_empty());
}

#[tokio::test]
async fn test_index_covers_whole_cache_history() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::new());
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 1).await;

    pipeline.run("# Old\nfrom an earlier note\n").await.unwrap();
    let report = pipeline.run("# New\nfresh\n").await.unwrap();

    assert_eq!(report.sections.len(), 1);
    assert_eq!(report.corpus_size, 2);
    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.rows[0].text, "# Old\nfrom an earlier note\n");
    assert_eq!(report.rows[0].neighbor_text, "# New\nfresh\n");
}

#[tokio::test]
async fn test_whitespace_variants_are_distinct_entries() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::new());
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 1).await;

    pipeline.run("# A\nfoo\n").await.unwrap();
    pipeline.run("# A\nfoo \n").await.unwrap();

    assert_eq!(provider.calls(), 2);
    assert_eq!(pipeline.cache().len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_provider_failure_aborts_run() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::failing_on("# B\nbar\n"));
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 1).await;

    let err = pipeline
        .run("# A\nfoo\n# B\nbar\n# C\nbaz\n")
        .await
        .unwrap_err();

    assert!(err.is_provider_error());
    assert!(matches!(
        err,
        RetrievalError::Embedding(EmbeddingError::ApiRequest { status: 403, .. })
    ));
    // Sequential population stops at the failing section.
    assert_eq!(provider.seen(), vec!["# A\nfoo\n", "# B\nbar\n"]);
    assert_eq!(pipeline.cache().lookup("# B\nbar\n").await.unwrap(), None);
    assert!(pipeline.cache().lookup("# A\nfoo\n").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_failure_aborts_and_releases_keys() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::failing_slowly(
        "# B\nbar\n",
        Duration::from_millis(50),
    ));
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 4).await;

    let err = pipeline
        .run("# A\nfoo\n# B\nbar\n# C\nbaz\n# D\nqux\n")
        .await
        .unwrap_err();

    assert!(err.is_provider_error());
    assert_eq!(pipeline.cache().lookup("# B\nbar\n").await.unwrap(), None);
    assert_eq!(pipeline.cache().inflight(), 0);

    // Dropped in-flight sections can be embedded by a later run.
    let retry = pipeline_with(&dir, Arc::new(CountingProvider::new()), 4).await;
    let report = retry.run("# C\nbaz\n# D\nqux\n").await.unwrap();
    assert_eq!(report.sections.len(), 2);
    assert_eq!(retry.cache().inflight(), 0);
}

#[tokio::test]
async fn test_similar_to_ranks_document_sections() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::new());
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 2).await;
    let document = "intro\n# A\nfoo\n# B\nbar\n# C\nbaz\n";

    let ranked = pipeline.similar_to(document, 8, 10).await.unwrap();

    let mut titles: Vec<&str> = ranked.iter().map(|s| s.title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, vec!["# B", "# C"]);
    assert_eq!(provider.calls(), 3);

    // The index behind a full run is unaffected by the ranking call.
    let report = pipeline.run(document).await.unwrap();
    assert_eq!(report.provider_calls, 0);
    assert_eq!(report.corpus_size, 3);
}

#[tokio::test]
async fn test_concurrent_population_embeds_duplicates_once() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(CountingProvider::slow(Duration::from_millis(10)));
    let pipeline = pipeline_with(&dir, Arc::clone(&provider), 4).await;

    let document = "# Same\nbody\n# Same\nbody\n# Other\nthing\n# Same\nbody\n";
    let report = pipeline.run(document).await.unwrap();

    assert_eq!(report.sections.len(), 4);
    assert_eq!(provider.calls(), 2);
    let unique: HashSet<String> = provider.seen().into_iter().collect();
    assert_eq!(unique.len(), 2);
    assert_eq!(pipeline.cache().len().await.unwrap(), 2);
    assert_eq!(report.rows.len(), 2);
}

#[tokio::test]
async fn test_from_config_with_hash_provider() {
    let dir = TempDir::new().unwrap();
    let config = RetrievalConfig::new(dir.path().join("db/embeddings.db"))
        .with_dimension(6)
        .with_provider(ProviderConfig {
            kind: ProviderKind::Hash,
            ..ProviderConfig::default()
        });

    let pipeline = RetrievalPipeline::from_config(&config).await.unwrap();
    let report = pipeline.run("# One\na\n# Two\nb\n# Three\nc\n").await.unwrap();

    assert_eq!(report.provider_calls, 3);
    assert_eq!(report.rows.len(), 3);
    assert_eq!(pipeline.cache().dimension(), Some(6));

    let entries = pipeline.cache().entries().await.unwrap();
    assert!(entries.iter().all(|e| e.embedding.len() == 6));
}

#[tokio::test]
async fn test_mixed_dimension_cache_fails_indexing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("embeddings.db");
    {
        let cache = EmbeddingCache::open(&path).await.unwrap();
        cache.store("# Legacy\nrow\n", &[1.0, 2.0, 3.0]).await.unwrap();
    }

    let provider = Arc::new(CountingProvider::new());
    let pipeline = pipeline_with(&dir, provider, 1).await;
    let err = pipeline.run("# New\nrow\n").await.unwrap_err();

    assert!(matches!(
        err,
        RetrievalError::Embedding(EmbeddingError::DimensionMismatch { .. })
    ));
}
