//! # Embeddings
//!
//! This crate computes, caches and searches embeddings for note sections.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors through an
//!   [`EmbeddingProvider`]
//! - **Persistent Caching**: A SQLite-backed store keyed by the exact text, so
//!   each distinct section is embedded at most once
//! - **Similarity Search**: A flat (exact) squared-L2 nearest-neighbor index
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► EmbeddingCache ──► FlatIndex            │
//! │       │                    │                  │                 │
//! │       ▼                    ▼                  ▼                 │
//! │  OpenAI/Hash           codec (blob)      NeighborResult        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod codec;
pub mod error;
pub mod index;
pub mod provider;
pub mod similarity;

pub use cache::{CacheStats, CachedProvider, EmbeddingCache};
pub use error::{EmbeddingError, Result};
pub use index::{FlatIndex, IndexEntry, Neighbor, NeighborResult, SelfMatchPolicy};
pub use provider::{
    EmbeddingProvider, HashProvider, OpenAIProvider, ResilientProvider, RetryPolicy,
};
pub use similarity::{euclidean_distance, squared_l2_distance};

/// A dense vector embedding.
pub type Embedding = Vec<f64>;
