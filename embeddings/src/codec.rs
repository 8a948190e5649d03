//! Binary encoding of embeddings for storage.
//!
//! Layout (all little-endian):
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────────────┐
//! │ magic "NV64" │ count: u32   │ count × f64 (IEEE-754)       │
//! └────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! The element count makes a blob decodable without knowing the
//! installation's dimension, and lets truncated writes be detected.

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Leading bytes of every encoded vector.
pub const MAGIC: [u8; 4] = *b"NV64";

const HEADER_LEN: usize = MAGIC.len() + size_of::<u32>();

/// Serialize a vector to a byte-exact blob.
pub fn encode(vector: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + size_of_val(vector));
    bytes.extend_from_slice(&MAGIC);
    // Embedding dimensions are far below u32::MAX; saturate rather than wrap.
    let count = u32::try_from(vector.len()).unwrap_or(u32::MAX);
    bytes.extend_from_slice(&count.to_le_bytes());
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a blob produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<Embedding> {
    let Some((header, payload)) = blob.split_at_checked(HEADER_LEN) else {
        return Err(EmbeddingError::CorruptData(format!(
            "blob too short for header: {} bytes",
            blob.len()
        )));
    };

    let (magic, count) = header.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(EmbeddingError::CorruptData(format!(
            "unexpected magic bytes {magic:02x?}"
        )));
    }

    let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize;
    let expected = count
        .checked_mul(size_of::<f64>())
        .ok_or_else(|| EmbeddingError::CorruptData(format!("element count overflow: {count}")))?;
    if payload.len() != expected {
        return Err(EmbeddingError::CorruptData(format!(
            "expected {expected} payload bytes for {count} elements, got {}",
            payload.len()
        )));
    }

    let mut vector = Vec::with_capacity(count);
    for chunk in payload.chunks_exact(size_of::<f64>()) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        vector.push(f64::from_le_bytes(raw));
    }
    Ok(vector)
}
