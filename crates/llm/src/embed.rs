use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

use crate::client::OllamaClient;
use crate::{Embedder, LlmError};

/// Retrieval re-embeds the same queries often; a small cache avoids a round
/// trip to the model server on repeats.
const EMBED_CACHE_CAPACITY: usize = 128;

/// [`Embedder`] backed by Ollama's embeddings endpoint.
pub struct OllamaEmbedder {
    client: Arc<OllamaClient>,
    model: String,
    /// Used once per call when `model` is not installed (HTTP 404).
    fallback_model: Option<String>,
    dim: usize,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    pub fn new(client: Arc<OllamaClient>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            client,
            model: model.into(),
            fallback_model: None,
            dim,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBED_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        if let Some(hit) = self.cache.lock().await.get(text) {
            trace!(chars = text.len(), "embedding cache hit");
            return Ok(hit.clone());
        }

        let vector = self
            .client
            .embed(&self.model, self.fallback_model.as_deref(), text)
            .await?;
        self.cache
            .lock()
            .await
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
