//! Vector-store capability: persist memory chunks and run nearest-neighbour
//! search reordered by a combined similarity/utility score.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::MemoryError;
use crate::schema::MemoryChunk;

/// Fetch this many times `top_k` ANN candidates before combined-score
/// reordering, so a high-utility chunk just outside the raw top-k can still
/// surface.
const OVERSAMPLE_FACTOR: usize = 2;

/// One search hit with its combined score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: MemoryChunk,
    pub combined_score: f64,
}

/// Aggregate view over stored utility scores, for the stats command.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorStats {
    pub chunks: usize,
    /// 0.0 when the store is empty.
    pub average_utility: f64,
    pub high_utility: usize,
    pub medium_utility: usize,
    pub low_utility: usize,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The fixed embedding dimension D enforced on insert.
    fn dim(&self) -> usize;

    /// Insert a chunk.  Fails with [`MemoryError::SchemaMismatch`] when the
    /// embedding length differs from D; nothing is partially inserted.
    async fn persist(&self, chunk: MemoryChunk) -> Result<(), MemoryError>;

    /// Up to `top_k` chunks ordered by combined score.  Returned chunks have
    /// their access metadata refreshed.
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, MemoryError>;

    async fn count(&self) -> Result<usize, MemoryError>;

    /// Average utility and the high/medium/low distribution over all rows.
    async fn stats(&self) -> Result<VectorStats, MemoryError>;
}

/// Distribution buckets: ≥0.8 high, 0.4–0.8 medium, <0.4 low.
pub(crate) fn tally_utility(scores: &[f64]) -> VectorStats {
    let chunks = scores.len();
    let average_utility = if chunks == 0 {
        0.0
    } else {
        scores.iter().sum::<f64>() / chunks as f64
    };
    VectorStats {
        chunks,
        average_utility,
        high_utility: scores.iter().filter(|&&score| score >= 0.8).count(),
        medium_utility: scores
            .iter()
            .filter(|&&score| (0.4..0.8).contains(&score))
            .count(),
        low_utility: scores.iter().filter(|&&score| score < 0.4).count(),
    }
}

/// Reorder an ANN candidate list (already similarity-ordered) by
/// `0.7 · rank + 0.3 · utility` and truncate to `top_k`.
pub(crate) fn rank_by_combined_score(
    candidates: Vec<MemoryChunk>,
    top_k: usize,
) -> Vec<ScoredChunk> {
    let len = candidates.len().max(1) as f64;
    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let rank_score = 1.0 - (i as f64 / len);
            let combined_score = 0.7 * rank_score + 0.3 * chunk.utility_score;
            ScoredChunk {
                chunk,
                combined_score,
            }
        })
        .collect();
    scored.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    scored.truncate(top_k);
    scored
}

pub(crate) fn oversample(top_k: usize) -> usize {
    top_k.saturating_mul(OVERSAMPLE_FACTOR).max(1)
}

// ── In-memory backend ─────────────────────────────────────────────────────────

/// Naive backend scanning every row with cosine similarity.  Used for tests,
/// for `vector_backend = "memory"`, and as the documented degraded mode when
/// no native index is available.
pub struct InMemoryVectorStore {
    dim: usize,
    rows: Mutex<Vec<MemoryChunk>>,
}

impl InMemoryVectorStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            rows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn persist(&self, chunk: MemoryChunk) -> Result<(), MemoryError> {
        if chunk.embedding.len() != self.dim {
            return Err(MemoryError::SchemaMismatch {
                expected: self.dim,
                actual: chunk.embedding.len(),
            });
        }
        self.rows.lock().await.push(chunk);
        Ok(())
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, MemoryError> {
        let mut rows = self.rows.lock().await;

        let mut by_similarity: Vec<(f64, usize)> = rows
            .iter()
            .enumerate()
            .map(|(idx, row)| (cosine(vector, &row.embedding), idx))
            .collect();
        by_similarity.sort_by(|a, b| b.0.total_cmp(&a.0));

        let candidates: Vec<MemoryChunk> = by_similarity
            .iter()
            .take(oversample(top_k))
            .map(|&(_, idx)| rows[idx].clone())
            .collect();

        let mut hits = rank_by_combined_score(candidates, top_k);
        trace!(hits = hits.len(), "vector search complete");

        // Retrieval is the only mutation chunks ever see.
        let now = Utc::now();
        for hit in &mut hits {
            hit.chunk.last_accessed_at = now;
            hit.chunk.access_count += 1;
            if let Some(row) = rows.iter_mut().find(|row| row.id == hit.chunk.id) {
                row.last_accessed_at = now;
                row.access_count = hit.chunk.access_count;
            }
        }
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.rows.lock().await.len())
    }

    async fn stats(&self) -> Result<VectorStats, MemoryError> {
        let scores: Vec<f64> = self
            .rows
            .lock()
            .await
            .iter()
            .map(|row| row.utility_score)
            .collect();
        Ok(tally_utility(&scores))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
