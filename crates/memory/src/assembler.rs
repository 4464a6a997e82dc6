//! Context assembly: blend the recent verbatim dialogue with retrieved
//! long-term memories under a token budget.
//!
//! The two retrieval legs (vector, graph) run concurrently; candidates then
//! pass through temporal decay, merge/dedup, semantic rerank, and budgeted
//! formatting.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use loam_config::RetrievalConfig;
use loam_llm::{Embedder, Reranker};

use crate::graph::GraphStore;
use crate::schema::{FactType, Relationship, RelationshipStatus};
use crate::vector::VectorStore;

/// Facts created within this window get the recency boost.
const RECENCY_WINDOW_DAYS: i64 = 7;
const RECENCY_BOOST: f64 = 1.3;
const ONGOING_BOOST: f64 = 1.2;
const COMPLETED_PENALTY: f64 = 0.8;
/// Applied when the last user message appears verbatim in a candidate.
const TOPIC_BOOST: f64 = 1.4;

static ENTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9'\-]+\b").expect("entity pattern is valid")
});

/// One message of the in-session dialogue.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalSource {
    Vector,
    Graph,
}

/// A candidate memory flowing through the scoring pipeline.
#[derive(Debug, Clone)]
pub struct RetrievedContext {
    pub content: String,
    pub source: RetrievalSource,
    pub relevance_score: f64,
    pub temporal_score: f64,
    pub final_score: f64,
    pub created_at: DateTime<Utc>,
    pub fact_type: FactType,
    pub utility_score: f64,
}

pub struct ContextAssembler {
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    reranker: Arc<dyn Reranker>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl ContextAssembler {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        reranker: Arc<dyn Reranker>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            vector,
            graph,
            reranker,
            embedder,
            config,
        }
    }

    /// Build the full context string for one turn.  Degrades gracefully: a
    /// failed retrieval leg contributes nothing, and the sliding window
    /// alone is always produced.
    pub async fn assemble(&self, query: &str, history: &[HistoryMessage]) -> String {
        let sliding = sliding_window(history, self.config.sliding_window_tokens);
        let remaining_tokens = self
            .config
            .max_context_tokens
            .saturating_sub(count_tokens(&sliding));

        let now = Utc::now();
        let (vector_results, graph_results) =
            tokio::join!(self.vector_leg(query), self.graph_leg(query, now));

        let mut candidates: Vec<RetrievedContext> = vector_results;
        candidates.extend(graph_results);
        for candidate in &mut candidates {
            candidate.temporal_score = temporal_decay(
                candidate.created_at,
                candidate.fact_type,
                candidate.utility_score,
                &self.config,
                now,
            );
            candidate.final_score = candidate.relevance_score * candidate.temporal_score;
        }

        let candidates = merge_candidates(candidates);
        let reranked = self
            .rerank(query, candidates, last_user_message(history))
            .await;

        let memory_context = format_memories(&reranked, remaining_tokens);
        debug!(
            memories = reranked.len(),
            window_tokens = count_tokens(&sliding),
            "context assembled"
        );
        build_final_context(&sliding, &memory_context)
    }

    async fn vector_leg(&self, query: &str) -> Vec<RetrievedContext> {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "query embedding failed, vector leg skipped");
                return Vec::new();
            }
        };
        let hits = match self
            .vector
            .search(&embedding, self.config.vector_search_top_k)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "vector search failed");
                return Vec::new();
            }
        };

        hits.into_iter()
            .map(|hit| RetrievedContext {
                content: hit.chunk.content.clone(),
                source: RetrievalSource::Vector,
                relevance_score: hit.combined_score,
                temporal_score: 1.0,
                final_score: hit.combined_score,
                created_at: hit.chunk.created_at,
                fact_type: hit.chunk.fact_type,
                utility_score: hit.chunk.utility_score,
            })
            .collect()
    }

    async fn graph_leg(&self, query: &str, now: DateTime<Utc>) -> Vec<RetrievedContext> {
        let names = extract_query_entities(query);
        if names.is_empty() {
            return Vec::new();
        }

        // Oversample so the superseded/expired filter below doesn't starve
        // the leg.
        let fetch = self.config.graph_search_top_k * 2;
        let relationships = match self.graph.search_relationships(&names, fetch).await {
            Ok(relationships) => relationships,
            Err(err) => {
                warn!(error = %err, "graph search failed");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for rel in relationships {
            if rel.is_superseded() {
                continue;
            }
            if rel.valid_until.is_some_and(|until| until < now) {
                continue;
            }
            let relevance = graph_relevance(&rel, now);
            results.push(RetrievedContext {
                content: format_relationship(&rel),
                source: RetrievalSource::Graph,
                relevance_score: relevance,
                temporal_score: 1.0,
                final_score: relevance,
                created_at: rel.created_at,
                fact_type: FactType::Episodic,
                utility_score: 0.5,
            });
            if results.len() >= self.config.graph_search_top_k {
                break;
            }
        }
        results
    }

    async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievedContext>,
        last_user: Option<String>,
    ) -> Vec<RetrievedContext> {
        if candidates.is_empty() {
            return candidates;
        }

        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|candidate| (query.to_string(), candidate.content.clone()))
            .collect();
        let scores = match self.reranker.predict(&pairs).await {
            Ok(scores) => scores,
            Err(err) => {
                warn!(error = %err, "rerank failed, keeping pre-rerank order");
                Vec::new()
            }
        };

        let needle = last_user
            .map(|text| text.trim().to_lowercase())
            .filter(|text| !text.is_empty());

        for (i, candidate) in candidates.iter_mut().enumerate() {
            let score = scores.get(i).copied().unwrap_or(0.0);
            // A missing or zero score means "no signal", not "irrelevant".
            if score > 0.0 {
                candidate.final_score *= score as f64;
            }
            if let Some(ref needle) = needle {
                if candidate.content.to_lowercase().contains(needle.as_str()) {
                    candidate.final_score *= TOPIC_BOOST;
                }
            }
        }

        candidates.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        candidates.truncate(self.config.rerank_top_k);
        candidates
    }
}

// ── Scoring pieces ────────────────────────────────────────────────────────────

/// Characters/4, floored at one token.
pub(crate) fn count_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Walk the history newest→oldest under the window budget, rendered in
/// chronological order as `ROLE: content` lines.
pub(crate) fn sliding_window(history: &[HistoryMessage], budget_tokens: usize) -> String {
    let mut lines = Vec::new();
    let mut tokens = 0;
    for message in history.iter().rev() {
        let message_tokens = count_tokens(&message.content);
        if tokens + message_tokens > budget_tokens {
            break;
        }
        lines.push(format!(
            "{}: {}",
            message.role.to_uppercase(),
            message.content
        ));
        tokens += message_tokens;
    }
    lines.reverse();
    lines.join("\n")
}

fn last_user_message(history: &[HistoryMessage]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.clone())
}

/// Candidate entity names for the graph leg: capitalised tokens, plus the
/// literal `User` when the query is first-person or mentions a project.
pub(crate) fn extract_query_entities(query: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for found in ENTITY_PATTERN.find_iter(query) {
        let name = found.as_str().to_string();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }

    let lowered = query.to_lowercase();
    let first_person = lowered
        .split(|ch: char| !ch.is_alphanumeric() && ch != '\'')
        .any(|token| matches!(token, "i" | "i'm" | "i've" | "i'd" | "me" | "my" | "mine"));
    if (first_person || lowered.contains("project")) && seen.insert("User".to_string()) {
        names.push("User".to_string());
    }
    names
}

/// Half-life decay by fact type and utility tier.  Core facts are exempt.
pub(crate) fn temporal_decay(
    created_at: DateTime<Utc>,
    fact_type: FactType,
    utility_score: f64,
    config: &RetrievalConfig,
    now: DateTime<Utc>,
) -> f64 {
    if fact_type == FactType::Core {
        return 1.0;
    }

    let half_life_days = if utility_score >= 0.9 {
        config.temporal_decay_high
    } else if utility_score >= 0.5 {
        config.temporal_decay_medium
    } else {
        config.temporal_decay_low
    };
    if half_life_days == 0 {
        return 1.0;
    }

    let age_days = (now - created_at).num_days().max(0) as f64;
    0.5_f64.powf(age_days / half_life_days as f64)
}

/// Base graph relevance: confidence-weighted, boosted for recency and live
/// status, penalised once a state has completed.
pub(crate) fn graph_relevance(rel: &Relationship, now: DateTime<Utc>) -> f64 {
    let mut relevance = 0.4 * rel.confidence;
    if (now - rel.created_at).num_days() < RECENCY_WINDOW_DAYS {
        relevance *= RECENCY_BOOST;
    }
    match rel.status {
        None | Some(RelationshipStatus::Ongoing) => relevance *= ONGOING_BOOST,
        Some(RelationshipStatus::Completed) => relevance *= COMPLETED_PENALTY,
        Some(RelationshipStatus::Planned) => {}
    }
    relevance
}

/// Render a relationship so the downstream generator cannot mistake a
/// finished state for a current one.
pub(crate) fn format_relationship(rel: &Relationship) -> String {
    let subject = &rel.subject;
    let object = &rel.object;
    match rel.predicate.as_str() {
        "BROKE_UP_WITH" => format!("{subject} broke up with {object} (no longer together)"),
        "DIVORCED_FROM" => format!("{subject} divorced {object} (no longer married)"),
        "QUIT" => format!("{subject} quit {object} (no longer working there)"),
        "LEFT" => format!("{subject} left {object} (no longer there)"),
        "MOVED_FROM" => format!("{subject} moved from {object} (no longer there)"),
        predicate if rel.status == Some(RelationshipStatus::Completed) => {
            format!("{subject} {predicate} {object} (completed)")
        }
        predicate => format!("{subject} {predicate} {object}"),
    }
}

/// Key = (content, source); the higher-scoring duplicate wins.
pub(crate) fn merge_candidates(candidates: Vec<RetrievedContext>) -> Vec<RetrievedContext> {
    let mut merged: HashMap<(String, RetrievalSource), RetrievedContext> = HashMap::new();
    for candidate in candidates {
        let key = (candidate.content.clone(), candidate.source);
        match merged.get(&key) {
            Some(existing) if existing.final_score >= candidate.final_score => {}
            _ => {
                merged.insert(key, candidate);
            }
        }
    }
    merged.into_values().collect()
}

/// Bullet list under the remaining token budget.  Entries are dropped whole,
/// never truncated mid-line.
pub(crate) fn format_memories(memories: &[RetrievedContext], max_tokens: usize) -> String {
    let mut entries = Vec::new();
    let mut tokens = 0;
    for memory in memories {
        let entry_tokens = count_tokens(&memory.content);
        if tokens + entry_tokens > max_tokens {
            break;
        }
        entries.push(format!("- {}", memory.content));
        tokens += entry_tokens;
    }
    entries.join("\n")
}

fn build_final_context(sliding: &str, memories: &str) -> String {
    if sliding.is_empty() {
        format!("## Relevant Memories\n{memories}")
    } else {
        format!("## Recent Conversation\n{sliding}\n\n## Relevant Memories\n{memories}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
