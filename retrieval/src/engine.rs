//! Retrieval pipeline implementation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{StreamExt, TryStreamExt};
use notes_embeddings::{
    Embedding, EmbeddingCache, EmbeddingProvider, FlatIndex, IndexEntry, NeighborResult,
    SelfMatchPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{QueryConfig, RetrievalConfig};
use crate::error::{Result, RetrievalError};
use crate::splitter::{HeaderSplitter, Section, SectionSplitter};

/// Stages of a single pipeline run, in order. A run never re-enters an
/// earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Splitting,
    Populating,
    Loading,
    Indexing,
    Querying,
    Reporting,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Splitting => "splitting",
            Self::Populating => "populating",
            Self::Loading => "loading",
            Self::Indexing => "indexing",
            Self::Querying => "querying",
            Self::Reporting => "reporting",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A cached text paired with its closest other cached text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarSection {
    /// Text of the query row.
    pub text: String,

    /// Text of the nearest non-self neighbor.
    pub neighbor_text: String,

    /// Row positions and squared-L2 distance.
    pub result: NeighborResult,
}

/// A section of one document ranked by distance to a chosen section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSection {
    /// Squared-L2 distance to the chosen section.
    pub distance: f64,

    /// Heading line of the section.
    pub title: String,

    /// Byte offset of the heading line.
    pub start_offset: usize,

    /// Full section text.
    pub text: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Sections found in the document.
    pub sections: Vec<Section>,

    /// Embeddings computed during this run (cache misses).
    pub provider_calls: u64,

    /// Number of cached texts the index was built over.
    pub corpus_size: usize,

    /// One row per cached text that has a neighbor, in cache order.
    pub rows: Vec<SimilarSection>,
}

/// Split → populate cache → load every cached row → index → query → report.
///
/// The index always covers the whole cache, including texts cached by earlier
/// runs over other documents.
pub struct RetrievalPipeline {
    /// Embedding cache.
    cache: Arc<EmbeddingCache>,

    /// Provider used on cache misses.
    provider: Arc<dyn EmbeddingProvider>,

    /// Document splitter.
    splitter: Box<dyn SectionSplitter>,

    /// Query settings.
    query: QueryConfig,

    /// Sections embedded at once.
    concurrency: usize,
}

impl RetrievalPipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> RetrievalPipelineBuilder {
        RetrievalPipelineBuilder::new()
    }

    /// Open the configured cache and provider.
    pub async fn from_config(config: &RetrievalConfig) -> Result<Self> {
        config.validate()?;

        let mut cache = EmbeddingCache::open(&config.database_path).await?;
        if let Some(dimension) = config.dimension {
            cache = cache.with_dimension(dimension);
        }
        let provider = config.provider.build(config.dimension)?;

        Self::builder()
            .with_cache(Arc::new(cache))
            .with_provider(provider)
            .with_query(config.query.clone())
            .with_concurrency(config.populate.concurrency)
            .build()
    }

    /// Get the embedding cache.
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Run the pipeline over one document.
    ///
    /// A provider failure while populating aborts the run; texts embedded
    /// before the failure stay cached.
    pub async fn run(&self, document: &str) -> Result<PipelineReport> {
        let mut stage = PipelineStage::Idle;

        advance(&mut stage, PipelineStage::Splitting);
        let sections = self.splitter.sections(document);
        debug!("Found {} sections", sections.len());

        advance(&mut stage, PipelineStage::Populating);
        let (_, provider_calls) = self.populate(&sections).await?;

        advance(&mut stage, PipelineStage::Loading);
        let entries = self.cache.entries().await?;

        advance(&mut stage, PipelineStage::Indexing);
        let index = FlatIndex::from_entries(&entries)?;

        advance(&mut stage, PipelineStage::Querying);
        let results = index.nearest_others(self.query.neighbors, self.query.self_match)?;

        advance(&mut stage, PipelineStage::Reporting);
        let rows = report_rows(&entries, results);

        advance(&mut stage, PipelineStage::Done);
        info!(
            "Embedded {provider_calls} of {} sections, reported {} rows over {} cached texts",
            sections.len(),
            rows.len(),
            entries.len()
        );

        Ok(PipelineReport {
            sections,
            provider_calls,
            corpus_size: entries.len(),
            rows,
        })
    }

    /// Rank the other sections of `document` by distance to the section
    /// containing byte `offset`, nearest first, keeping at most `k`.
    ///
    /// Only sections of this document are ranked; their embeddings go through
    /// the cache like in [`RetrievalPipeline::run`].
    pub async fn similar_to(
        &self,
        document: &str,
        offset: usize,
        k: usize,
    ) -> Result<Vec<ScoredSection>> {
        let sections = self.splitter.sections(document);
        let selected = sections
            .iter()
            .rposition(|s| (s.start_offset..s.start_offset + s.text.len()).contains(&offset))
            .ok_or(RetrievalError::NoSection { offset })?;
        debug!("Ranking against section: {}", sections[selected].title());

        let (embeddings, _) = self.populate(&sections).await?;
        let query = embeddings[selected].clone();
        let index = FlatIndex::build(embeddings)?;
        let ranked = index.search_one(&query, index.len())?;

        Ok(ranked
            .into_iter()
            .filter(|n| n.id != selected)
            .take(k)
            .filter_map(|n| {
                let section = sections.get(n.id)?;
                Some(ScoredSection {
                    distance: n.distance,
                    title: section.title().to_string(),
                    start_offset: section.start_offset,
                    text: section.text.clone(),
                })
            })
            .collect())
    }

    /// Get-or-compute every section's embedding, at most `concurrency` at a
    /// time. Stops at the first failure.
    ///
    /// Returns the embeddings in section order and how many were computed by
    /// this call.
    async fn populate(&self, sections: &[Section]) -> Result<(Vec<Embedding>, u64)> {
        let cache = &self.cache;
        let provider = &self.provider;
        let computed = &AtomicU64::new(0);

        let embeddings: Vec<Embedding> = futures::stream::iter(sections)
            .map(|section| async move {
                debug!("Populating section: {}", section.title());
                cache
                    .get_or_compute(&section.text, |text| async move {
                        computed.fetch_add(1, Ordering::Relaxed);
                        provider.embed(&text).await
                    })
                    .await
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        Ok((embeddings, computed.load(Ordering::Relaxed)))
    }
}

fn advance(stage: &mut PipelineStage, next: PipelineStage) {
    debug_assert!(next > *stage);
    info!("Pipeline stage: {stage} -> {next}");
    *stage = next;
}

fn report_rows(entries: &[IndexEntry], results: Vec<NeighborResult>) -> Vec<SimilarSection> {
    results
        .into_iter()
        .filter_map(|result| {
            let query = entries.get(result.query_index)?;
            let neighbor = entries.get(result.neighbor_index)?;
            Some(SimilarSection {
                text: query.text.clone(),
                neighbor_text: neighbor.text.clone(),
                result,
            })
        })
        .collect()
}

/// Builder for [`RetrievalPipeline`].
pub struct RetrievalPipelineBuilder {
    cache: Option<Arc<EmbeddingCache>>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    splitter: Option<Box<dyn SectionSplitter>>,
    query: QueryConfig,
    concurrency: usize,
}

impl RetrievalPipelineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            cache: None,
            provider: None,
            splitter: None,
            query: QueryConfig::default(),
            concurrency: 1,
        }
    }

    /// Set the embedding cache.
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the embedding provider.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Replace the default `# ` heading splitter.
    pub fn with_splitter(mut self, splitter: impl SectionSplitter + 'static) -> Self {
        self.splitter = Some(Box::new(splitter));
        self
    }

    /// Set the query configuration.
    pub fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    /// Set the number of neighbors requested per row.
    pub fn with_neighbors(mut self, neighbors: usize) -> Self {
        self.query.neighbors = neighbors;
        self
    }

    /// Set how self-matches are recognized.
    pub fn with_self_match(mut self, policy: SelfMatchPolicy) -> Self {
        self.query.self_match = policy;
        self
    }

    /// Set how many sections are embedded concurrently.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Build the pipeline.
    pub fn build(self) -> Result<RetrievalPipeline> {
        let cache = self
            .cache
            .ok_or_else(|| RetrievalError::Config("pipeline needs an embedding cache".into()))?;
        let provider = self
            .provider
            .ok_or_else(|| RetrievalError::Config("pipeline needs an embedding provider".into()))?;
        if self.query.neighbors == 0 || self.concurrency == 0 {
            return Err(RetrievalError::Config(
                "neighbors and concurrency must be at least 1".into(),
            ));
        }
        let splitter = match self.splitter {
            Some(splitter) => splitter,
            None => Box::new(HeaderSplitter::new()?),
        };

        Ok(RetrievalPipeline {
            cache,
            provider,
            splitter,
            query: self.query,
            concurrency: self.concurrency,
        })
    }
}

impl Default for RetrievalPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
