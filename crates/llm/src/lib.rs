//! Capability interfaces for the local model server plus their Ollama-backed
//! implementations.
//!
//! The rest of the workspace talks to three narrow traits — [`Generator`],
//! [`Embedder`], [`Reranker`] — so the memory pipeline can be exercised with
//! scripted fakes in tests while production wiring uses [`OllamaClient`].

mod client;
mod embed;
mod parse;
mod rerank;
mod retry;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use client::{GenerateRequest, OllamaClient};
pub use embed::OllamaEmbedder;
pub use parse::{JsonExtractError, parse_json_as, parse_json_response};
pub use rerank::{EmbeddingReranker, Reranker};
pub use retry::{RetryPolicy, retry_on_timeout};

/// Errors surfaced by the model-server clients.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The request did not complete within the configured deadline.  The
    /// only transient kind — retried with backoff by [`retry_on_timeout`].
    #[error("model server timed out")]
    Timeout,
    #[error("model server returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("unexpected model response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Prompt-completion capability of a chat-style model.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError>;

    /// Stream tokens through `tx` as they arrive and return the full
    /// accumulated response.  The token sequence is finite and cannot be
    /// restarted; callers that only need the final text may drop `rx`.
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError>;
}

/// Fixed-dimension text embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Dimension of the vectors produced by [`Embedder::embed`].
    fn dim(&self) -> usize;
}
