//! Distance computation and ranking for embeddings.

use ordered_float::OrderedFloat;

use crate::error::{EmbeddingError, Result};

fn check_dimensions(a: &[f64], b: &[f64]) -> Result<()> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Compute the squared euclidean (L2²) distance between two embeddings.
///
/// Monotonic with [`euclidean_distance`] but skips the square root, which is
/// all a nearest-neighbor ranking needs.
pub fn squared_l2_distance(a: &[f64], b: &[f64]) -> Result<f64> {
    check_dimensions(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum())
}

/// Compute the euclidean distance between two embeddings.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> Result<f64> {
    Ok(squared_l2_distance(a, b)?.sqrt())
}

/// Rank `candidates` by ascending squared-L2 distance to `query` and keep the
/// first `k`.
///
/// Candidates at equal distance keep their relative order, so the lower
/// position wins ties.
pub fn find_top_k(query: &[f64], candidates: &[Vec<f64>], k: usize) -> Result<Vec<(usize, f64)>> {
    let mut scored: Vec<(OrderedFloat<f64>, usize)> = Vec::with_capacity(candidates.len());
    for (id, candidate) in candidates.iter().enumerate() {
        let distance = squared_l2_distance(query, candidate)?;
        scored.push((OrderedFloat(distance), id));
    }

    scored.sort();

    Ok(scored
        .into_iter()
        .take(k)
        .map(|(distance, id)| (id, distance.0))
        .collect())
}
