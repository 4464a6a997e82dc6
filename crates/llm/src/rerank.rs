use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::{Embedder, LlmError};

/// Scores (query, passage) pairs by semantic relevance; higher is better.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns one score per input pair.  Empty input yields empty output.
    async fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, LlmError>;
}

/// Cross-encoder proxy: scores each pair by cosine similarity of its two
/// embeddings.  The query side is embedded once per distinct query (and the
/// embedder caches repeats), so a batch of candidates costs one embedding
/// call per passage.
pub struct EmbeddingReranker {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingReranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, LlmError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut scores = Vec::with_capacity(pairs.len());
        for (query, passage) in pairs {
            let q = self.embedder.embed(query).await?;
            let p = self.embedder.embed(passage).await?;
            scores.push(cosine_similarity(&q, &p));
        }
        trace!(pairs = pairs.len(), "reranked candidate batch");
        Ok(scores)
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}
