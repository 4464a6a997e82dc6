use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    /// Model used for the main conversational response.
    pub main_model: String,
    /// Smaller model used for all observer distillation calls.
    pub observer_model: String,
    pub embedding_model: String,
    /// Embedding dimension D.  Fixed at startup and enforced on every
    /// vector-store insert; must match what `embedding_model` produces.
    pub embedding_dim: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            main_model: "qwen3:8b".to_string(),
            observer_model: "qwen3:1.7b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dim: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Vector backend: `"qdrant"` or `"memory"`.  The vector store is
    /// required — startup fails when the configured backend is unreachable.
    pub vector_backend: String,
    pub qdrant_url: String,
    pub qdrant_collection: String,
    /// Path of the embedded graph database.  When it cannot be opened the
    /// engine falls back to the in-memory graph store with a warning.
    pub graph_path: String,
    pub conversations_dir: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            vector_backend: "qdrant".to_string(),
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_collection: "memories".to_string(),
            graph_path: "./data/graph.redb".to_string(),
            conversations_dir: "./data/conversations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Total token budget for the assembled context.
    pub max_context_tokens: usize,
    /// Max tokens of recent dialogue included verbatim.
    pub sliding_window_tokens: usize,
    pub vector_search_top_k: usize,
    pub graph_search_top_k: usize,
    pub rerank_top_k: usize,
    /// Temporal decay half-lives in days by utility tier.  0 disables decay;
    /// core facts never decay regardless.
    pub temporal_decay_core: u32,
    pub temporal_decay_high: u32,
    pub temporal_decay_medium: u32,
    pub temporal_decay_low: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 3000,
            sliding_window_tokens: 2000,
            vector_search_top_k: 15,
            graph_search_top_k: 10,
            rerank_top_k: 5,
            temporal_decay_core: 0,
            temporal_decay_high: 180,
            temporal_decay_medium: 60,
            temporal_decay_low: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Max observer tasks in flight.  Each observer fans out ~4 generator
    /// calls, so this bounds the load on the local model server.
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            request_timeout_secs: 180,
            max_retries: 3,
            retry_base_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub retrieval: RetrievalConfig,
    pub observer: ObserverConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = AppConfig::default();
        assert_eq!(config.retrieval.max_context_tokens, 3000);
        assert_eq!(config.retrieval.sliding_window_tokens, 2000);
        assert_eq!(config.retrieval.rerank_top_k, 5);
        assert_eq!(config.observer.concurrency, 2);
        assert_eq!(config.llm.embedding_dim, 768);
        assert_eq!(config.retrieval.temporal_decay_core, 0);
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let config = AppConfig::load_from("/nonexistent/loam.toml")?;
        assert_eq!(config.memory.vector_backend, "qdrant");
        Ok(())
    }

    #[test]
    fn save_and_reload_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config").join("loam.toml");

        let mut config = AppConfig::default();
        config.llm.main_model = "llama3.1:8b".to_string();
        config.retrieval.vector_search_top_k = 25;
        config.save_to(&path)?;

        let reloaded = AppConfig::load_from(&path)?;
        assert_eq!(reloaded.llm.main_model, "llama3.1:8b");
        assert_eq!(reloaded.retrieval.vector_search_top_k, 25);
        Ok(())
    }

    #[test]
    fn partial_file_fills_missing_sections_with_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("loam.toml");
        fs::write(&path, "[llm]\nmain_model = \"mistral:7b\"\n")?;

        let config = AppConfig::load_from(&path)?;
        assert_eq!(config.llm.main_model, "mistral:7b");
        // Untouched sections come from Default.
        assert_eq!(config.retrieval.graph_search_top_k, 10);
        assert_eq!(config.observer.max_retries, 3);
        Ok(())
    }
}
