//! Flat nearest-neighbor index over a fixed batch of embeddings.
//!
//! Every query is compared against every stored vector, so results are exact.
//! The index is immutable once built: if the underlying entries change, build
//! a new one.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::find_top_k;

/// A text paired with its embedding, as loaded from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The cached text.
    pub text: String,

    /// The embedding vector.
    pub embedding: Embedding,
}

/// One ranked match for a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Position of the matched vector in the build input.
    pub id: usize,

    /// Squared euclidean distance to the query.
    pub distance: f64,
}

/// The closest other entry for one query row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborResult {
    /// Position of the query vector.
    pub query_index: usize,

    /// Position of the matched vector.
    pub neighbor_index: usize,

    /// Squared euclidean (L2²) distance between the two vectors.
    pub distance: f64,
}

/// How a self-match is recognized when the index is queried with its own
/// vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfMatchPolicy {
    /// Drop the result whose id equals the query's position.
    #[default]
    SkipSameId,
    /// Drop every result at distance zero.
    SkipZeroDistance,
}

impl SelfMatchPolicy {
    fn is_self_match(self, query_index: usize, neighbor: &Neighbor) -> bool {
        match self {
            Self::SkipSameId => neighbor.id == query_index,
            Self::SkipZeroDistance => neighbor.distance == 0.0,
        }
    }
}

/// A brute-force squared-L2 index.
///
/// Ids are positions in the vector sequence given to [`FlatIndex::build`].
#[derive(Debug, Clone)]
pub struct FlatIndex {
    /// Stored vectors, id == position.
    vectors: Vec<Embedding>,

    /// Shared dimension of every stored vector.
    dimension: usize,
}

impl FlatIndex {
    /// Build an index over exactly these vectors.
    ///
    /// Fails with [`EmbeddingError::DimensionMismatch`] before anything is
    /// stored if the vectors do not all share the first vector's dimension.
    pub fn build(vectors: Vec<Embedding>) -> Result<Self> {
        let dimension = vectors.first().map_or(0, Vec::len);

        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        info!(
            "Built flat index over {} vectors of dimension {dimension}",
            vectors.len()
        );
        Ok(Self { vectors, dimension })
    }

    /// Build an index from cache entries, keeping their order.
    pub fn from_entries(entries: &[IndexEntry]) -> Result<Self> {
        Self::build(entries.iter().map(|e| e.embedding.clone()).collect())
    }

    /// Dimension of the indexed vectors (0 for an empty index).
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Get a stored vector by id.
    pub fn get(&self, id: usize) -> Option<&Embedding> {
        self.vectors.get(id)
    }

    /// Find up to `k` nearest vectors for a single query, ascending by
    /// distance, ties broken by ascending id.
    pub fn search_one(&self, query: &[f64], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        if query.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let ranked = find_top_k(query, &self.vectors, k)?;
        Ok(ranked
            .into_iter()
            .map(|(id, distance)| Neighbor { id, distance })
            .collect())
    }

    /// Run [`FlatIndex::search_one`] for every query, in order.
    pub fn search(&self, queries: &[Embedding], k: usize) -> Result<Vec<Vec<Neighbor>>> {
        debug!("Searching {} queries with k={k}", queries.len());
        queries.iter().map(|q| self.search_one(q, k)).collect()
    }

    /// Query the index with its own vectors and report, for each one, the
    /// closest result that is not a self-match.
    ///
    /// Rows with no remaining candidate among the top `k` are omitted.
    pub fn nearest_others(&self, k: usize, policy: SelfMatchPolicy) -> Result<Vec<NeighborResult>> {
        let rows = self.search(&self.vectors, k)?;

        Ok(rows
            .into_iter()
            .enumerate()
            .filter_map(|(query_index, neighbors)| {
                neighbors
                    .into_iter()
                    .find(|n| !policy.is_self_match(query_index, n))
                    .map(|n| NeighborResult {
                        query_index,
                        neighbor_index: n.id,
                        distance: n.distance,
                    })
            })
            .collect())
    }
}
