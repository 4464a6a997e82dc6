//! The observer distills each completed turn into persistent memory: grade
//! the turn, fan out structured extraction, resolve contradictions against
//! the graph, then persist to both stores.
//!
//! ```text
//! grade ──> (extract user ∥ extract assistant ∥ summarize ∥ queries)
//!       ──> source-tagged merge ──> contradiction check
//!       ──> (vector persist ∥ graph persist)
//! ```
//!
//! The pipeline never returns an error to its caller: a failed stage shrinks
//! the output instead of aborting the turn.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use loam_llm::{Embedder, GenerateRequest, Generator, RetryPolicy, parse_json_response,
    retry_on_timeout};

use crate::graph::GraphStore;
use crate::prompts;
use crate::schema::{
    ChunkType, Entity, Extraction, FactSource, FactType, MemoryChunk, Relationship,
    RelationshipDraft, UtilityGrade,
};
use crate::vector::VectorStore;

/// Existing facts offered to the contradiction prompt per new relationship.
/// Bounded to keep the prompt inside the small observer model's context.
const MAX_EXISTING_FACTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalType {
    StateCompletion,
    MutualExclusion,
    AttributeUpdate,
}

impl TemporalType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "state_completion" => Some(TemporalType::StateCompletion),
            "mutual_exclusion" => Some(TemporalType::MutualExclusion),
            "attribute_update" => Some(TemporalType::AttributeUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContradictionConfidence {
    High,
    Medium,
    Low,
}

impl ContradictionConfidence {
    fn parse(value: &str) -> Self {
        match value {
            "high" => ContradictionConfidence::High,
            "medium" => ContradictionConfidence::Medium,
            _ => ContradictionConfidence::Low,
        }
    }
}

/// One contradiction reported by the detection prompt (or the rule-based
/// fallback), before filtering by confidence.
#[derive(Debug, Clone)]
struct DetectedContradiction {
    existing_id: String,
    existing_statement: String,
    reason: String,
    temporal_type: Option<TemporalType>,
    confidence: ContradictionConfidence,
}

/// A contradiction that was acted upon: the existing fact has been marked
/// superseded by `new_statement`.
#[derive(Debug, Clone)]
pub struct ContradictionRecord {
    pub existing_fact_id: String,
    pub existing_statement: String,
    pub new_statement: String,
    pub reason: String,
    pub temporal_type: Option<TemporalType>,
}

#[derive(Debug, Clone)]
pub struct ObserverOutput {
    pub utility_grade: UtilityGrade,
    pub summary: Option<String>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<RelationshipDraft>,
    pub contradictions: Vec<ContradictionRecord>,
    pub retrieval_queries: Vec<String>,
}

impl ObserverOutput {
    fn empty(utility_grade: UtilityGrade) -> Self {
        Self {
            utility_grade,
            summary: None,
            entities: Vec::new(),
            relationships: Vec::new(),
            contradictions: Vec::new(),
            retrieval_queries: Vec::new(),
        }
    }
}

pub struct Observer {
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    model: String,
    retry: RetryPolicy,
}

impl Observer {
    pub fn new(
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            embedder,
            vector,
            graph,
            model: model.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Distill one completed turn.  Infallible by contract — the worst case
    /// is an empty output and a warning in the log.
    pub async fn process_turn(
        &self,
        user_message: &str,
        assistant_response: &str,
        conversation_id: &str,
        turn_index: usize,
    ) -> ObserverOutput {
        let combined = format!("USER: {user_message}\nASSISTANT: {assistant_response}");
        let user_only = format!("USER: {user_message}");
        let assistant_only = format!("ASSISTANT: {assistant_response}");

        // Gatekeeper: one cheap call decides whether the turn is worth the
        // other four.
        let Some(utility_grade) = self.grade_utility(&combined).await else {
            warn!(conversation_id, turn_index, "observer turn abandoned, grading unavailable");
            return ObserverOutput::empty(UtilityGrade::Low);
        };
        if utility_grade.is_discard() {
            debug!(conversation_id, turn_index, "turn discarded");
            return ObserverOutput::empty(UtilityGrade::Discard);
        }

        // Extraction runs per speaker so facts can be trust-tagged; summary
        // and retrieval queries want the full exchange.
        let (user_data, assistant_data, summary, retrieval_queries) = tokio::join!(
            self.extract_structured(&user_only),
            self.extract_structured(&assistant_only),
            self.generate_summary(&combined),
            self.generate_retrieval_queries(&combined),
        );

        let fact_type = user_data.fact_type;
        let mut entities = user_data.entities;
        entities.extend(assistant_data.entities);

        let user_relationships: Vec<RelationshipDraft> = user_data
            .relationships
            .into_iter()
            .map(|draft| draft.with_source(FactSource::UserStated))
            .collect();
        let user_keys: HashSet<(String, String)> = user_relationships
            .iter()
            .map(|rel| (rel.subject.clone(), rel.predicate.clone()))
            .collect();
        // User statements are ground truth; an assistant inference about the
        // same (subject, predicate) is dropped outright.
        let assistant_relationships: Vec<RelationshipDraft> = assistant_data
            .relationships
            .into_iter()
            .map(|draft| draft.with_source(FactSource::AssistantInferred))
            .filter(|rel| !user_keys.contains(&(rel.subject.clone(), rel.predicate.clone())))
            .collect();

        let mut relationships = user_relationships;
        relationships.extend(assistant_relationships);

        let contradictions = self.check_contradictions(&relationships).await;

        tokio::join!(
            self.persist_to_vector_store(
                &combined,
                summary.as_deref().unwrap_or(""),
                &retrieval_queries,
                conversation_id,
                turn_index,
                utility_grade,
                fact_type,
            ),
            self.persist_to_graph_store(&entities, &relationships),
        );

        info!(
            conversation_id,
            turn_index,
            grade = ?utility_grade,
            entities = entities.len(),
            relationships = relationships.len(),
            contradictions = contradictions.len(),
            "turn distilled"
        );

        ObserverOutput {
            utility_grade,
            summary,
            entities,
            relationships,
            contradictions,
            retrieval_queries,
        }
    }

    async fn call_model(&self, prompt: String) -> Result<String, loam_llm::LlmError> {
        let generator = self.generator.clone();
        let model = self.model.clone();
        retry_on_timeout(
            move || {
                let generator = generator.clone();
                let request = GenerateRequest::new(model.clone(), prompt.clone());
                async move { generator.generate(request).await }
            },
            self.retry,
        )
        .await
    }

    /// `None` only when the grading call itself failed; an unrecognised
    /// answer degrades to LOW.
    async fn grade_utility(&self, text: &str) -> Option<UtilityGrade> {
        match self.call_model(prompts::utility_prompt(text)).await {
            Ok(response) => {
                let cleaned = response.trim().to_string();
                match UtilityGrade::parse(&cleaned) {
                    Some(grade) => {
                        debug!(grade = ?grade, "utility graded");
                        Some(grade)
                    }
                    None => {
                        warn!(response = %cleaned, "unrecognized utility grade, defaulting to LOW");
                        Some(UtilityGrade::Low)
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "utility grading call failed");
                None
            }
        }
    }

    async fn generate_summary(&self, text: &str) -> Option<String> {
        match self.call_model(prompts::summary_prompt(text)).await {
            Ok(response) => Some(response.trim().to_string()),
            Err(err) => {
                warn!(error = %err, "summary generation failed");
                None
            }
        }
    }

    async fn generate_retrieval_queries(&self, text: &str) -> Vec<String> {
        let response = match self.call_model(prompts::queries_prompt(text)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "retrieval query generation failed");
                return Vec::new();
            }
        };
        match serde_json::from_str::<serde_json::Value>(response.trim()) {
            Ok(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str())
                .map(ToString::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn extract_structured(&self, text: &str) -> Extraction {
        let response = match self.call_model(prompts::extraction_prompt(text)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "extraction call failed");
                return Extraction::default();
            }
        };
        match parse_json_response(&response) {
            Ok(value) => Extraction::from_value(&value),
            Err(err) => {
                warn!(error = %err, "extraction output unparseable");
                Extraction::default()
            }
        }
    }

    // ── Contradiction detection ───────────────────────────────────────────────

    async fn check_contradictions(
        &self,
        relationships: &[RelationshipDraft],
    ) -> Vec<ContradictionRecord> {
        let mut records = Vec::new();
        for rel in relationships {
            let existing = self.related_facts(&rel.subject, &rel.object).await;
            if existing.is_empty() {
                continue;
            }

            let new_statement = rel.statement();
            for contradiction in self.detect_contradictions(rel, &existing).await {
                // Only high confidence justifies rewriting history.
                if contradiction.confidence != ContradictionConfidence::High {
                    continue;
                }
                if let Err(err) = self
                    .graph
                    .mark_contradiction(&contradiction.existing_id, &new_statement)
                    .await
                {
                    warn!(error = %err, existing_id = %contradiction.existing_id,
                        "failed to mark superseded relationship");
                }
                records.push(ContradictionRecord {
                    existing_fact_id: contradiction.existing_id,
                    existing_statement: contradiction.existing_statement,
                    new_statement: new_statement.clone(),
                    reason: contradiction.reason,
                    temporal_type: contradiction.temporal_type,
                });
            }
        }
        records
    }

    /// All stored relationships involving either endpoint of the new fact,
    /// on either side of the edge.
    async fn related_facts(&self, subject: &str, object: &str) -> Vec<Relationship> {
        let mut facts = Vec::new();
        let mut seen = HashSet::new();
        let mut extend = |batch: Result<Vec<Relationship>, _>| {
            if let Ok(rels) = batch {
                for rel in rels {
                    if seen.insert(rel.id.clone()) {
                        facts.push(rel);
                    }
                }
            }
        };
        extend(self.graph.query(subject, None).await);
        extend(self.graph.query_by_object(subject, None).await);
        if !object.is_empty() && object != subject {
            extend(self.graph.query(object, None).await);
            extend(self.graph.query_by_object(object, None).await);
        }
        facts
    }

    async fn detect_contradictions(
        &self,
        new_rel: &RelationshipDraft,
        existing: &[Relationship],
    ) -> Vec<DetectedContradiction> {
        let mut listing = String::from("[\n");
        for rel in existing.iter().take(MAX_EXISTING_FACTS) {
            listing.push_str(&format!(
                "  {{\"id\": \"{}\", \"subject\": \"{}\", \"predicate\": \"{}\", \"object\": \"{}\"}},\n",
                rel.id, rel.subject, rel.predicate, rel.object
            ));
        }
        listing.push(']');

        let prompt = prompts::contradiction_prompt(&new_rel.statement(), &listing);
        let parsed = match self.call_model(prompt).await {
            Ok(response) => parse_json_response(&response),
            Err(err) => {
                warn!(error = %err, "contradiction detection call failed, using rule fallback");
                return simple_contradiction_check(new_rel, existing);
            }
        };
        match parsed {
            Ok(value) => parse_contradictions(&value, existing),
            Err(err) => {
                warn!(error = %err, "contradiction output unparseable, using rule fallback");
                simple_contradiction_check(new_rel, existing)
            }
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn persist_to_vector_store(
        &self,
        content: &str,
        summary: &str,
        retrieval_queries: &[String],
        conversation_id: &str,
        turn_index: usize,
        utility_grade: UtilityGrade,
        fact_type: FactType,
    ) {
        let embedding = match self.embedder.embed(content).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "embedding failed, vector persistence skipped");
                return;
            }
        };

        let now = Utc::now();
        let chunk = MemoryChunk {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            summary: summary.to_string(),
            embedding,
            chunk_type: ChunkType::Conversation,
            source_conversation_id: conversation_id.to_string(),
            turn_index: turn_index as i64,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            retrieval_queries: retrieval_queries.to_vec(),
            utility_score: utility_grade.score(),
            fact_type,
        };

        // Graph persistence proceeds regardless — a schema violation is
        // fatal only for this turn's vector write.
        if let Err(err) = self.vector.persist(chunk).await {
            warn!(error = %err, "vector persistence failed for this turn");
        }
    }

    async fn persist_to_graph_store(
        &self,
        entities: &[Entity],
        relationships: &[RelationshipDraft],
    ) {
        if let Err(err) = self.graph.persist_entities(entities).await {
            warn!(error = %err, "entity persistence failed");
        }
        if let Err(err) = self.graph.persist_relationships(relationships).await {
            warn!(error = %err, "relationship persistence failed");
        }
    }
}

fn parse_contradictions(
    value: &serde_json::Value,
    existing: &[Relationship],
) -> Vec<DetectedContradiction> {
    value
        .get("contradictions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let existing_id = match item.get("existing_id") {
                        Some(serde_json::Value::String(id)) => id.clone(),
                        Some(serde_json::Value::Number(id)) => id.to_string(),
                        _ => return None,
                    };
                    let existing_statement = item
                        .get("existing_statement")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .or_else(|| {
                            existing
                                .iter()
                                .find(|rel| rel.id == existing_id)
                                .map(Relationship::statement)
                        })
                        .unwrap_or_default();
                    Some(DetectedContradiction {
                        existing_id,
                        existing_statement,
                        reason: item
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        temporal_type: item
                            .get("temporal_type")
                            .and_then(|v| v.as_str())
                            .and_then(TemporalType::parse),
                        confidence: item
                            .get("confidence")
                            .and_then(|v| v.as_str())
                            .map(ContradictionConfidence::parse)
                            .unwrap_or(ContradictionConfidence::Low),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Rule fallback when the model yields nothing usable: the same
/// (subject, predicate) pointing at a different object is a high-confidence
/// contradiction.
fn simple_contradiction_check(
    new_rel: &RelationshipDraft,
    existing: &[Relationship],
) -> Vec<DetectedContradiction> {
    existing
        .iter()
        .filter(|rel| {
            rel.subject == new_rel.subject
                && rel.predicate == new_rel.predicate
                && rel.object != new_rel.object
        })
        .map(|rel| DetectedContradiction {
            existing_id: rel.id.clone(),
            existing_statement: rel.statement(),
            reason: "Same predicate with different object".to_string(),
            temporal_type: None,
            confidence: ContradictionConfidence::High,
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use loam_llm::LlmError;

    use super::*;
    use crate::graph::{GraphStore, InMemoryGraphStore};
    use crate::schema::RelationshipStatus;
    use crate::vector::InMemoryVectorStore;

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

    /// Answers each pipeline stage from a canned script, dispatched on
    /// distinctive prompt markers.
    #[derive(Default)]
    struct ScriptedGenerator {
        utility: String,
        summary: String,
        queries: String,
        user_extraction: String,
        assistant_extraction: String,
        contradiction: String,
    }

    impl ScriptedGenerator {
        fn answer(&self, prompt: &str) -> String {
            if prompt.contains("Rate the memory-worthiness") {
                self.utility.clone()
            } else if prompt.contains("ONE SENTENCE SUMMARY") {
                self.summary.clone()
            } else if prompt.contains("List 2-3 questions") {
                self.queries.clone()
            } else if prompt.contains("NEW RELATIONSHIP:") {
                self.contradiction.clone()
            } else if prompt.contains("TURN:\nASSISTANT:") {
                self.assistant_extraction.clone()
            } else {
                self.user_extraction.clone()
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError> {
            Ok(self.answer(&request.prompt))
        }

        async fn generate_stream(
            &self,
            request: GenerateRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<String, LlmError> {
            let full = self.answer(&request.prompt);
            let _ = tx.send(full.clone()).await;
            Ok(full)
        }
    }

    struct Fixture {
        observer: Observer,
        vector: Arc<InMemoryVectorStore>,
        graph: Arc<InMemoryGraphStore>,
    }

    fn fixture(script: ScriptedGenerator) -> Fixture {
        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let graph = Arc::new(InMemoryGraphStore::new());
        let observer = Observer::new(
            Arc::new(script),
            Arc::new(FakeEmbedder),
            vector.clone(),
            graph.clone(),
            "test-model",
        );
        Fixture {
            observer,
            vector,
            graph,
        }
    }

    fn empty_extraction() -> String {
        r#"{"fact_type": "episodic", "entities": [], "relationships": []}"#.to_string()
    }

    fn no_contradictions() -> String {
        r#"{"contradictions": []}"#.to_string()
    }

    #[tokio::test]
    async fn discard_turn_produces_no_writes() {
        let fx = fixture(ScriptedGenerator {
            utility: "DISCARD".to_string(),
            ..Default::default()
        });

        let output = fx
            .observer
            .process_turn("thanks!", "You're welcome!", "conv", 0)
            .await;

        assert_eq!(output.utility_grade, UtilityGrade::Discard);
        assert!(output.summary.is_none());
        assert!(output.relationships.is_empty());
        assert_eq!(fx.vector.count().await.unwrap(), 0);
        let stats = fx.graph.stats().await.unwrap();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.relationships, 0);
    }

    #[tokio::test]
    async fn employment_change_supersedes_the_old_fact() {
        let graph = Arc::new(InMemoryGraphStore::new());
        graph
            .persist_relationships(&[RelationshipDraft::new("User", "WORKS_AT", "Acme")])
            .await
            .unwrap();
        let acme_id = graph.query("User", None).await.unwrap()[0].id.clone();

        let script = ScriptedGenerator {
            utility: "IMPORTANT".to_string(),
            summary: "User started a new job at NewCorp.".to_string(),
            queries: r#"["Where does the user work?"]"#.to_string(),
            user_extraction: r#"{
                "fact_type": "core",
                "entities": [
                    {"name": "User", "type": "Person", "attributes": {}},
                    {"name": "NewCorp", "type": "Organization", "attributes": {}}
                ],
                "relationships": [
                    {"subject": "User", "predicate": "WORKS_AT", "object": "NewCorp", "metadata": {}}
                ]
            }"#
            .to_string(),
            assistant_extraction: empty_extraction(),
            contradiction: format!(
                r#"{{"contradictions": [{{
                    "existing_id": "{acme_id}",
                    "existing_statement": "User WORKS_AT Acme",
                    "reason": "User now works at NewCorp",
                    "temporal_type": "mutual_exclusion",
                    "confidence": "high"
                }}]}}"#
            ),
        };

        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let observer = Observer::new(
            Arc::new(script),
            Arc::new(FakeEmbedder),
            vector.clone(),
            graph.clone(),
            "test-model",
        );

        let output = observer
            .process_turn("I just started at NewCorp", "Congratulations!", "conv", 3)
            .await;

        assert_eq!(output.contradictions.len(), 1);
        assert_eq!(output.contradictions[0].existing_statement, "User WORKS_AT Acme");
        assert_eq!(output.contradictions[0].new_statement, "User WORKS_AT NewCorp");
        assert_eq!(
            output.contradictions[0].temporal_type,
            Some(TemporalType::MutualExclusion)
        );

        // Exactly one live WORKS_AT remains.
        let rels = graph.query("User", Some("WORKS_AT")).await.unwrap();
        assert_eq!(rels.len(), 2);
        let acme = rels.iter().find(|r| r.object == "Acme").unwrap();
        assert_eq!(acme.status, Some(RelationshipStatus::Completed));
        assert_eq!(acme.superseded_by.as_deref(), Some("User WORKS_AT NewCorp"));
        let live: Vec<_> = rels.iter().filter(|r| !r.is_superseded()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].object, "NewCorp");

        // The chunk carries the IMPORTANT score and core fact type.
        let hits = vector.search(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.utility_score, 1.0);
        assert_eq!(hits[0].chunk.fact_type, FactType::Core);
        assert_eq!(hits[0].chunk.summary, "User started a new job at NewCorp.");
    }

    #[tokio::test]
    async fn visit_completion_marks_state_completed() {
        let graph = Arc::new(InMemoryGraphStore::new());
        graph
            .persist_relationships(&[RelationshipDraft::new("Mom", "VISITING", "Philadelphia")])
            .await
            .unwrap();
        let visiting_id = graph.query("Mom", None).await.unwrap()[0].id.clone();

        let script = ScriptedGenerator {
            utility: "IMPORTANT".to_string(),
            summary: "Mom returned home to Massachusetts.".to_string(),
            queries: "[]".to_string(),
            user_extraction: r#"{
                "fact_type": "episodic",
                "entities": [{"name": "Mom", "type": "Person", "attributes": {}}],
                "relationships": [
                    {"subject": "Mom", "predicate": "RETURNED_HOME", "object": "Massachusetts", "metadata": {}}
                ]
            }"#
            .to_string(),
            assistant_extraction: empty_extraction(),
            contradiction: format!(
                r#"{{"contradictions": [{{
                    "existing_id": "{visiting_id}",
                    "existing_statement": "Mom VISITING Philadelphia",
                    "reason": "RETURNED_HOME completes the visit",
                    "temporal_type": "state_completion",
                    "confidence": "high"
                }}]}}"#
            ),
        };

        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let observer = Observer::new(
            Arc::new(script),
            Arc::new(FakeEmbedder),
            vector,
            graph.clone(),
            "test-model",
        );

        let output = observer
            .process_turn("Mom went back home to Massachusetts", "Glad you had time together!", "conv", 1)
            .await;

        assert_eq!(output.contradictions.len(), 1);
        assert_eq!(
            output.contradictions[0].temporal_type,
            Some(TemporalType::StateCompletion)
        );

        let visiting = graph.query("Mom", Some("VISITING")).await.unwrap().remove(0);
        assert_eq!(visiting.status, Some(RelationshipStatus::Completed));
        assert!(visiting.is_superseded());
        let returned = graph.query("Mom", Some("RETURNED_HOME")).await.unwrap();
        assert_eq!(returned.len(), 1);
        assert!(!returned[0].is_superseded());
    }

    #[tokio::test]
    async fn unparseable_contradiction_output_falls_back_to_predicate_rule() {
        let graph = Arc::new(InMemoryGraphStore::new());
        graph
            .persist_relationships(&[RelationshipDraft::new("User", "WORKS_AT", "Acme")])
            .await
            .unwrap();

        let script = ScriptedGenerator {
            utility: "STORE".to_string(),
            summary: "Job update.".to_string(),
            queries: "[]".to_string(),
            user_extraction: r#"{
                "fact_type": "core",
                "entities": [],
                "relationships": [
                    {"subject": "User", "predicate": "WORKS_AT", "object": "NewCorp", "metadata": {}}
                ]
            }"#
            .to_string(),
            assistant_extraction: empty_extraction(),
            contradiction: "I don't think these conflict, to be honest.".to_string(),
        };

        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let observer = Observer::new(
            Arc::new(script),
            Arc::new(FakeEmbedder),
            vector,
            graph.clone(),
            "test-model",
        );

        let output = observer
            .process_turn("I work at NewCorp now", "Noted!", "conv", 5)
            .await;

        assert_eq!(output.contradictions.len(), 1);
        assert_eq!(output.contradictions[0].reason, "Same predicate with different object");
        assert!(output.contradictions[0].temporal_type.is_none());
        let acme = graph
            .query("User", Some("WORKS_AT"))
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.object == "Acme")
            .unwrap();
        assert!(acme.is_superseded());
    }

    #[tokio::test]
    async fn user_statements_dominate_assistant_inferences() {
        let script = ScriptedGenerator {
            utility: "STORE".to_string(),
            summary: "Project chat.".to_string(),
            queries: "[]".to_string(),
            user_extraction: r#"{
                "fact_type": "episodic",
                "entities": [{"name": "User", "type": "Person", "attributes": {}}],
                "relationships": [
                    {"subject": "User", "predicate": "WORKS_ON", "object": "basketcall", "metadata": {}}
                ]
            }"#
            .to_string(),
            assistant_extraction: r#"{
                "fact_type": "episodic",
                "entities": [{"name": "Sarah", "type": "Person", "attributes": {}}],
                "relationships": [
                    {"subject": "User", "predicate": "WORKS_ON", "object": "notes-app", "metadata": {}},
                    {"subject": "Sarah", "predicate": "LIKES", "object": "hiking", "metadata": {}}
                ]
            }"#
            .to_string(),
            contradiction: no_contradictions(),
        };
        let fx = fixture(script);

        let output = fx
            .observer
            .process_turn("I'm working on basketcall", "Sounds like Sarah's kind of project!", "conv", 2)
            .await;

        // The colliding assistant inference is dropped before persistence…
        let works_on = fx.graph.query("User", Some("WORKS_ON")).await.unwrap();
        assert_eq!(works_on.len(), 1);
        assert_eq!(works_on[0].object, "basketcall");
        assert_eq!(works_on[0].source, FactSource::UserStated);
        assert_eq!(works_on[0].confidence, 1.0);

        // …while the non-colliding one survives with inferred confidence.
        let likes = fx.graph.query("Sarah", Some("LIKES")).await.unwrap();
        assert_eq!(likes.len(), 1);
        assert_eq!(likes[0].source, FactSource::AssistantInferred);
        assert_eq!(likes[0].confidence, 0.3);
        assert_eq!(output.relationships.len(), 2);
    }

    #[tokio::test]
    async fn malformed_extraction_degrades_to_chunk_only() {
        let script = ScriptedGenerator {
            utility: "STORE".to_string(),
            summary: "A useful note.".to_string(),
            queries: r#"["What did the user mention?"]"#.to_string(),
            user_extraction: "Sorry, I cannot produce JSON today.".to_string(),
            assistant_extraction: "Me neither.".to_string(),
            contradiction: no_contradictions(),
        };
        let fx = fixture(script);

        let output = fx
            .observer
            .process_turn("I like quiet mornings", "Noted.", "conv", 7)
            .await;

        assert!(output.entities.is_empty());
        assert!(output.relationships.is_empty());
        assert_eq!(output.retrieval_queries.len(), 1);
        assert_eq!(fx.graph.stats().await.unwrap().relationships, 0);

        // The turn itself is still remembered.
        assert_eq!(fx.vector.count().await.unwrap(), 1);
        let hit = fx.vector.search(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap().remove(0);
        assert_eq!(hit.chunk.utility_score, 0.6);
        assert_eq!(hit.chunk.fact_type, FactType::Episodic);
        assert!(hit.chunk.content.starts_with("USER: I like quiet mornings"));
    }

    #[tokio::test]
    async fn unknown_utility_word_defaults_to_low() {
        let script = ScriptedGenerator {
            utility: "MAYBE?".to_string(),
            summary: "Note.".to_string(),
            queries: "[]".to_string(),
            user_extraction: empty_extraction(),
            assistant_extraction: empty_extraction(),
            contradiction: no_contradictions(),
        };
        let fx = fixture(script);

        let output = fx
            .observer
            .process_turn("random chatter", "ok", "conv", 0)
            .await;

        assert_eq!(output.utility_grade, UtilityGrade::Low);
        let hit = fx.vector.search(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap().remove(0);
        assert_eq!(hit.chunk.utility_score, 0.3);
    }
}
