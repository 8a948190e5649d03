//! # Retrieval
//!
//! This crate finds, for every cached note section, the most similar other
//! section. It combines:
//!
//! - **Splitting**: Top-level `# ` headings divide a note into sections
//! - **Embeddings**: Each section is embedded once and cached persistently
//! - **Search**: A flat squared-L2 index over every cached section
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Retrieval Pipeline                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Section    │──►│  Embedding   │──►│    Flat      │         │
//! │  │   Splitter   │   │    Cache     │   │    Index     │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │                            │                  │                 │
//! │                            ▼                  ▼                 │
//! │                     ┌──────────────┐   ┌──────────────┐         │
//! │                     │   Provider   │   │    Report    │         │
//! │                     └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use notes_retrieval::{RetrievalConfig, RetrievalPipeline};
//!
//! let config = RetrievalConfig::load_or_default("notes.toml")?;
//! let pipeline = RetrievalPipeline::from_config(&config).await?;
//!
//! let report = pipeline.run(&std::fs::read_to_string("note.md")?).await?;
//! for row in &report.rows {
//!     println!("{} ~ {}", row.text, row.neighbor_text);
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod splitter;

pub use config::{PopulateConfig, ProviderConfig, ProviderKind, QueryConfig, RetrievalConfig};
pub use engine::{
    PipelineReport, PipelineStage, RetrievalPipeline, RetrievalPipelineBuilder, ScoredSection,
    SimilarSection,
};
pub use error::{Result, RetrievalError};
pub use splitter::{HeaderSplitter, Section, SectionBoundary, SectionSplitter};

// Re-export from dependencies for convenience
pub use notes_embeddings::{EmbeddingCache, EmbeddingProvider, FlatIndex, NeighborResult};
