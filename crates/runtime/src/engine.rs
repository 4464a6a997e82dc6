//! The engine: one value constructed at startup that owns every capability
//! and all mutable state — stores, the observer task set, and the
//! concurrency limiter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use loam_config::AppConfig;
use loam_llm::{
    Embedder, EmbeddingReranker, GenerateRequest, Generator, OllamaClient, OllamaEmbedder,
    Reranker, RetryPolicy,
};
use loam_memory::{
    ContextAssembler, GraphStats, GraphStore, HistoryMessage, InMemoryGraphStore,
    InMemoryVectorStore, Observer, QdrantVectorStore, RedbGraphStore, VectorStats, VectorStore,
};

use crate::conversation::ConversationLog;
use crate::prompt::build_system_prompt;

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub vector: VectorStats,
    pub graph: GraphStats,
}

pub struct Engine {
    config: AppConfig,
    generator: Arc<dyn Generator>,
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    assembler: ContextAssembler,
    observer: Arc<Observer>,
    observer_tasks: Mutex<JoinSet<()>>,
    observer_limit: Arc<Semaphore>,
    conversation_id: String,
    log: ConversationLog,
    turn_counter: AtomicUsize,
}

impl Engine {
    /// Wire the production stack: Ollama generator/embedder, Qdrant vector
    /// store (required — startup fails when unreachable), embedded graph
    /// store with in-memory fallback.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.observer.request_timeout_secs);
        let client = Arc::new(OllamaClient::new(&config.llm.ollama_base_url, timeout));
        let embedder: Arc<dyn Embedder> = Arc::new(
            OllamaEmbedder::new(
                client.clone(),
                &config.llm.embedding_model,
                config.llm.embedding_dim,
            )
            .with_fallback_model(&config.llm.main_model),
        );
        let reranker: Arc<dyn Reranker> = Arc::new(EmbeddingReranker::new(embedder.clone()));

        let vector: Arc<dyn VectorStore> = if config.memory.vector_backend == "memory" {
            Arc::new(InMemoryVectorStore::new(config.llm.embedding_dim))
        } else {
            Arc::new(
                QdrantVectorStore::connect(
                    &config.memory.qdrant_url,
                    &config.memory.qdrant_collection,
                    config.llm.embedding_dim,
                )
                .await
                .context("vector store is required at startup")?,
            )
        };

        let graph: Arc<dyn GraphStore> = match RedbGraphStore::open(&config.memory.graph_path) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, path = %config.memory.graph_path,
                    "graph backend unavailable, falling back to in-memory store");
                Arc::new(InMemoryGraphStore::new())
            }
        };

        Self::from_parts(config, client, embedder, reranker, vector, graph)
    }

    /// Assemble an engine from explicit capabilities.  Production wiring
    /// goes through [`Engine::new`]; tests inject fakes here.
    pub fn from_parts(
        config: AppConfig,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
    ) -> Result<Self> {
        let assembler = ContextAssembler::new(
            vector.clone(),
            graph.clone(),
            reranker,
            embedder.clone(),
            config.retrieval.clone(),
        );
        let retry = RetryPolicy {
            max_attempts: config.observer.max_retries.max(1),
            base_delay: Duration::from_secs(config.observer.retry_base_delay_secs),
        };
        let observer = Arc::new(
            Observer::new(
                generator.clone(),
                embedder,
                vector.clone(),
                graph.clone(),
                config.llm.observer_model.clone(),
            )
            .with_retry_policy(retry),
        );

        let conversation_id = Uuid::new_v4().to_string();
        let log = ConversationLog::start(&config.memory.conversations_dir, &conversation_id)?;
        let observer_limit = Arc::new(Semaphore::new(config.observer.concurrency.max(1)));

        info!(conversation_id = %conversation_id, "engine ready");
        Ok(Self {
            config,
            generator,
            vector,
            graph,
            assembler,
            observer,
            observer_tasks: Mutex::new(JoinSet::new()),
            observer_limit,
            conversation_id,
            log,
            turn_counter: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Run one turn: assemble context, stream the reply through `tx`, then
    /// hand the completed turn to a background observer.  Generator errors
    /// surface to the caller; observer errors never do.
    pub async fn respond(
        &self,
        user_message: &str,
        history: &[HistoryMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let context = self.assembler.assemble(user_message, history).await;
        let request = GenerateRequest::new(self.config.llm.main_model.clone(), user_message)
            .with_system(build_system_prompt(&context));

        let reply = self
            .generator
            .generate_stream(request, tx)
            .await
            .context("main response generation failed")?;
        let reply = reply.trim().to_string();

        let turn_index = self.turn_counter.fetch_add(1, Ordering::SeqCst);
        self.spawn_observer(user_message, &reply, turn_index).await;

        if let Err(err) = self.log.append_turn(turn_index, user_message, &reply) {
            warn!(error = %err, "failed to append turn to conversation log");
        }

        Ok(reply)
    }

    /// Queue the observer behind the concurrency limiter.  Tasks spawned for
    /// turn *i* may complete while turn *i+1* streams; retrieval observing
    /// none, some, or all of their effects is accepted.
    async fn spawn_observer(&self, user_message: &str, assistant_response: &str, turn_index: usize) {
        let observer = self.observer.clone();
        let semaphore = self.observer_limit.clone();
        let conversation_id = self.conversation_id.clone();
        let user = user_message.to_string();
        let assistant = assistant_response.to_string();

        self.observer_tasks.lock().await.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let output = observer
                .process_turn(&user, &assistant, &conversation_id, turn_index)
                .await;
            debug!(
                turn_index,
                grade = ?output.utility_grade,
                relationships = output.relationships.len(),
                contradictions = output.contradictions.len(),
                "observer finished turn"
            );
        });
    }

    /// Shutdown barrier: drain every in-flight observer, logging failures
    /// without propagating them.
    pub async fn wait_for_observers(&self) {
        let mut tasks = self.observer_tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "observer task failed");
            }
        }
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let vector = self.vector.stats().await?;
        let graph = self.graph.stats().await?;
        Ok(EngineStats { vector, graph })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use loam_llm::LlmError;
    use loam_memory::{InMemoryGraphStore, InMemoryVectorStore};

    use super::*;

    const DIM: usize = 4;

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }

        fn dim(&self) -> usize {
            DIM
        }
    }

    struct UnitReranker;

    #[async_trait]
    impl Reranker for UnitReranker {
        async fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, LlmError> {
            Ok(vec![1.0; pairs.len()])
        }
    }

    /// Streams a canned main reply; answers observer prompts from a script.
    struct ScriptedGenerator;

    impl ScriptedGenerator {
        fn answer(prompt: &str) -> String {
            if prompt.contains("Rate the memory-worthiness") {
                "STORE".to_string()
            } else if prompt.contains("ONE SENTENCE SUMMARY") {
                "User talked about their week.".to_string()
            } else if prompt.contains("List 2-3 questions") {
                "[]".to_string()
            } else if prompt.contains("NEW RELATIONSHIP:") {
                r#"{"contradictions": []}"#.to_string()
            } else if prompt.contains("Extract entities") {
                r#"{"fact_type": "episodic", "entities": [], "relationships": []}"#.to_string()
            } else {
                "Sounds like a good week!".to_string()
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError> {
            Ok(Self::answer(&request.prompt))
        }

        async fn generate_stream(
            &self,
            request: GenerateRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<String, LlmError> {
            let full = Self::answer(&request.prompt);
            for word in full.split_inclusive(' ') {
                let _ = tx.send(word.to_string()).await;
            }
            Ok(full)
        }
    }

    fn test_engine(dir: &tempfile::TempDir) -> Engine {
        let mut config = AppConfig::default();
        config.memory.conversations_dir = dir
            .path()
            .join("conversations")
            .to_string_lossy()
            .to_string();
        config.llm.embedding_dim = DIM;

        Engine::from_parts(
            config,
            Arc::new(ScriptedGenerator),
            Arc::new(FakeEmbedder),
            Arc::new(UnitReranker),
            Arc::new(InMemoryVectorStore::new(DIM)),
            Arc::new(InMemoryGraphStore::new()),
        )
        .expect("engine builds")
    }

    #[tokio::test]
    async fn turn_streams_tokens_and_persists_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);

        let (tx, mut rx) = mpsc::channel(64);
        let reply = engine
            .respond("I had a busy week at work", &[], tx)
            .await
            .unwrap();
        assert_eq!(reply, "Sounds like a good week!");

        // Every streamed token arrived, and they concatenate to the reply.
        let mut streamed = String::new();
        while let Ok(token) = rx.try_recv() {
            streamed.push_str(&token);
        }
        assert_eq!(streamed, "Sounds like a good week!");

        // The observer runs in the background; the shutdown barrier makes
        // its effects visible.
        engine.wait_for_observers().await;
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.vector.chunks, 1);
        // The scripted grader said STORE, so the lone chunk sits in the
        // medium utility bucket.
        assert_eq!(stats.vector.medium_utility, 1);
        assert!((stats.vector.average_utility - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn turns_are_appended_to_the_conversation_log() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);

        let (tx, _rx) = mpsc::channel(64);
        engine.respond("first message", &[], tx).await.unwrap();
        let (tx, _rx) = mpsc::channel(64);
        engine
            .respond(
                "second message",
                &[HistoryMessage::user("first message")],
                tx,
            )
            .await
            .unwrap();
        engine.wait_for_observers().await;

        let records = ConversationLog::load(engine.log.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[1], crate::LogRecord::Turn { turn_index: 0, .. }));
        assert!(matches!(&records[2], crate::LogRecord::Turn { turn_index: 1, .. }));
    }

    #[tokio::test]
    async fn wait_for_observers_is_safe_with_no_pending_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        engine.wait_for_observers().await;
    }
}
