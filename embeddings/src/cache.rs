//! Persistent embedding cache backed by SQLite.
//!
//! Rows are keyed by the exact section text: no trimming or normalization, so
//! `"a"` and `"a "` are distinct entries. Rows are never updated or deleted.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Embedding;
use crate::codec;
use crate::error::{EmbeddingError, Result};
use crate::index::IndexEntry;
use crate::provider::EmbeddingProvider;

type KeyLocks = HashMap<String, Arc<Mutex<()>>>;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS embeddings_text ON embeddings(text);
";

/// Cache for embeddings to avoid redundant provider calls.
///
/// Owns its SQLite connection; the connection closes when the cache is
/// dropped. Concurrent [`EmbeddingCache::get_or_compute`] calls for the same
/// missing text are serialized so the text is computed and stored once.
pub struct EmbeddingCache {
    /// Connection to the backing database.
    conn: Mutex<Connection>,

    /// Per-text locks held across check-then-insert on a miss.
    inflight: StdMutex<KeyLocks>,

    /// Fixed installation dimension, if enforced.
    dimension: Option<usize>,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Open (or create) a cache database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let cache = Self::with_connection(conn);
        cache.ensure_schema().await?;

        info!("Opened embedding cache at {}", path.display());
        Ok(cache)
    }

    /// Create a cache that lives only as long as this value.
    pub async fn open_in_memory() -> Result<Self> {
        let cache = Self::with_connection(Connection::open_in_memory()?);
        cache.ensure_schema().await?;
        Ok(cache)
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            inflight: StdMutex::new(HashMap::new()),
            dimension: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Reject vectors whose length differs from `dimension`.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// The enforced dimension, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Create the backing table and its unique text index if absent.
    ///
    /// Safe to call any number of times.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.conn.lock().await.execute_batch(SCHEMA_SQL)?;
        debug!("Embedding cache schema ready");
        Ok(())
    }

    /// Look up the embedding stored for exactly `text`.
    pub async fn lookup(&self, text: &str) -> Result<Option<Embedding>> {
        let conn = self.conn.lock().await;
        select_embedding(&conn, text)
    }

    /// Store a new row for `text`.
    ///
    /// Storing the same vector again is a no-op. Storing a different vector
    /// for a cached text fails with [`EmbeddingError::DuplicateKey`] and leaves
    /// the existing row untouched.
    pub async fn store(&self, text: &str, embedding: &[f64]) -> Result<()> {
        self.check_dimension(embedding)?;
        let blob = codec::encode(embedding);

        let conn = self.conn.lock().await;
        if insert_if_absent(&conn, text, &blob)? {
            debug!("Stored embedding for text ({} bytes)", text.len());
            return Ok(());
        }

        let existing: Vec<u8> = conn.query_row(
            "SELECT embedding FROM embeddings WHERE text = ?1",
            params![text],
            |row| row.get(0),
        )?;
        if existing == blob {
            Ok(())
        } else {
            Err(EmbeddingError::DuplicateKey {
                text: text.to_string(),
            })
        }
    }

    /// Return the cached embedding for `text`, computing and storing it on a
    /// miss.
    ///
    /// `compute` runs at most once per call and is never called on a hit.
    /// Its errors are returned as-is and nothing is cached for them.
    pub async fn get_or_compute<F, Fut>(&self, text: &str, compute: F) -> Result<Embedding>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Embedding>>,
    {
        if let Some(embedding) = self.lookup(text).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for embedding");
            return Ok(embedding);
        }

        // Released on drop, so a cancelled caller does not leave its key behind.
        let key_lock = KeyLock::acquire(&self.inflight, text);
        let _guard = key_lock.lock().await;
        self.compute_locked(text, compute).await
    }

    /// Miss path, run while holding the per-text lock.
    async fn compute_locked<F, Fut>(&self, text: &str, compute: F) -> Result<Embedding>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Embedding>>,
    {
        // Another caller may have filled the entry while we waited.
        if let Some(embedding) = self.lookup(text).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(embedding);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss, computing embedding");
        let embedding = compute(text.to_string()).await?;
        self.check_dimension(&embedding)?;

        let blob = codec::encode(&embedding);
        let conn = self.conn.lock().await;
        if !insert_if_absent(&conn, text, &blob)? {
            // Lost a race with another process sharing the database.
            debug!("Embedding inserted concurrently, returning stored row");
        }
        select_embedding(&conn, text)?.ok_or_else(|| {
            EmbeddingError::CorruptData("row vanished after insert".to_string())
        })
    }

    /// Number of texts with a miss currently being computed or waited on.
    pub fn inflight(&self) -> usize {
        lock_key_map(&self.inflight).len()
    }

    fn check_dimension(&self, embedding: &[f64]) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != embedding.len() => {
                Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Scan every cached row in insertion order.
    ///
    /// This is the whole historical corpus, not just one document's sections.
    pub async fn entries(&self) -> Result<Vec<IndexEntry>> {
        let rows = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare("SELECT id, text, embedding FROM embeddings ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (id, text, blob) in rows {
            let embedding = codec::decode(&blob).map_err(|e| match e {
                EmbeddingError::CorruptData(msg) => {
                    EmbeddingError::CorruptData(format!("row {id}: {msg}"))
                }
                other => other,
            })?;
            entries.push(IndexEntry { text, embedding });
        }

        debug!("Loaded {} cached embeddings", entries.len());
        Ok(entries)
    }

    /// Number of cached rows.
    pub async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Check if the cache holds no rows.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.len().await?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }
}

fn lock_key_map(locks: &StdMutex<KeyLocks>) -> std::sync::MutexGuard<'_, KeyLocks> {
    // The map stays consistent even if a holder panicked.
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared per-text lock, removed from the map when its last holder drops.
struct KeyLock<'a> {
    locks: &'a StdMutex<KeyLocks>,
    key: String,
    lock: Option<Arc<Mutex<()>>>,
}

impl<'a> KeyLock<'a> {
    fn acquire(locks: &'a StdMutex<KeyLocks>, key: &str) -> Self {
        let lock = Arc::clone(lock_key_map(locks).entry(key.to_string()).or_default());
        Self {
            locks,
            key: key.to_string(),
            lock: Some(lock),
        }
    }

    /// Only `None` once the lock has been released in `drop`.
    async fn lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        Some(self.lock.as_ref()?.lock().await)
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        let mut locks = lock_key_map(self.locks);
        // Clones are only made under the map lock, so a count of one means
        // the map holds the sole reference.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

fn select_embedding(conn: &Connection, text: &str) -> Result<Option<Embedding>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM embeddings WHERE text = ?1",
            params![text],
            |row| row.get(0),
        )
        .optional()?;
    blob.map(|b| codec::decode(&b)).transpose()
}

/// Returns whether a row was inserted.
fn insert_if_absent(conn: &Connection, text: &str, blob: &[u8]) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO embeddings (text, embedding) VALUES (?1, ?2)",
        params![text, blob],
    )?;
    Ok(inserted > 0)
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of rows in the cache.
    pub entries: usize,

    /// Lookups served from the cache.
    pub hits: u64,

    /// Lookups that invoked the compute function.
    pub misses: u64,
}

/// A provider that reads through an [`EmbeddingCache`].
pub struct CachedProvider<P> {
    provider: P,
    cache: Arc<EmbeddingCache>,
}

impl<P> CachedProvider<P>
where
    P: EmbeddingProvider,
{
    /// Create a new cached provider.
    pub fn new(provider: P, cache: Arc<EmbeddingCache>) -> Self {
        Self { provider, cache }
    }

    /// Get the underlying cache.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl<P> EmbeddingProvider for CachedProvider<P>
where
    P: EmbeddingProvider,
{
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn model(&self) -> &str {
        self.provider.model()
    }

    fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.cache
            .get_or_compute(text, |text| async move { self.provider.embed(&text).await })
            .await
    }

    fn is_available(&self) -> bool {
        self.provider.is_available()
    }
}
