//! Shared record types for the dual-store memory model: vector-store chunks,
//! graph entities and relationships, and the utility grading scale.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Vector-store records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Conversation,
    Document,
}

impl ChunkType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkType::Conversation => "conversation",
            ChunkType::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "document" => ChunkType::Document,
            _ => ChunkType::Conversation,
        }
    }
}

/// Governs temporal decay during retrieval: core facts never decay, the
/// other kinds decay by utility tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactType {
    Core,
    #[default]
    Episodic,
    Preference,
}

impl FactType {
    pub fn as_str(self) -> &'static str {
        match self {
            FactType::Core => "core",
            FactType::Episodic => "episodic",
            FactType::Preference => "preference",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "core" => FactType::Core,
            "preference" => FactType::Preference,
            _ => FactType::Episodic,
        }
    }
}

/// One distilled conversation turn as persisted in the vector store.
///
/// Chunks are written exclusively by the observer and never mutated after
/// insertion, except for `last_accessed_at`/`access_count` on retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: String,
    /// Verbatim `"USER: …\nASSISTANT: …"` concatenation of the turn.
    pub content: String,
    pub summary: String,
    pub embedding: Vec<f32>,
    pub chunk_type: ChunkType,
    pub source_conversation_id: String,
    pub turn_index: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    /// Questions this chunk could answer later, used as auxiliary retrieval
    /// keys.
    pub retrieval_queries: Vec<String>,
    pub utility_score: f64,
    pub fact_type: FactType,
}

// ── Utility grading ───────────────────────────────────────────────────────────

/// The observer's memorability classification for a turn.
///
/// `Discard`/`Store`/`Important` is the canonical three-level scale;
/// `Low`/`Medium`/`High` is the legacy four-level alias still accepted from
/// older grader models.  Only the numeric score is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtilityGrade {
    Discard,
    Store,
    Important,
    Low,
    Medium,
    High,
}

impl UtilityGrade {
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_ascii_uppercase().as_str() {
            "DISCARD" => Some(UtilityGrade::Discard),
            "STORE" => Some(UtilityGrade::Store),
            "IMPORTANT" => Some(UtilityGrade::Important),
            "LOW" => Some(UtilityGrade::Low),
            "MEDIUM" => Some(UtilityGrade::Medium),
            "HIGH" => Some(UtilityGrade::High),
            _ => None,
        }
    }

    /// Numeric utility used for combined scoring and decay tiering.
    pub fn score(self) -> f64 {
        match self {
            UtilityGrade::Discard => 0.0,
            UtilityGrade::Low => 0.3,
            UtilityGrade::Store | UtilityGrade::Medium => 0.6,
            UtilityGrade::Important | UtilityGrade::High => 1.0,
        }
    }

    pub fn is_discard(self) -> bool {
        self == UtilityGrade::Discard
    }
}

// ── Graph-store records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Person,
    Place,
    Organization,
    Technology,
    Concept,
    Event,
}

impl EntityType {
    /// Lenient parse for model output; unrecognised labels become `Concept`.
    pub fn parse(value: &str) -> Self {
        match value {
            "Person" => EntityType::Person,
            "Place" => EntityType::Place,
            "Organization" => EntityType::Organization,
            "Technology" => EntityType::Technology,
            "Event" => EntityType::Event,
            _ => EntityType::Concept,
        }
    }
}

/// An entity as extracted from a turn; the graph store upserts these by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub entity_type: EntityType,
    pub attributes: HashMap<String, Value>,
}

/// An entity as held by the graph store, with mention provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub name: String,
    pub entity_type: EntityType,
    pub attributes: HashMap<String, Value>,
    pub first_mentioned: DateTime<Utc>,
    pub last_mentioned: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    UserStated,
    AssistantInferred,
}

impl FactSource {
    /// By convention user statements are ground truth and assistant
    /// inferences may be hallucinated.
    pub fn default_confidence(self) -> f64 {
        match self {
            FactSource::UserStated => 1.0,
            FactSource::AssistantInferred => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    Ongoing,
    Completed,
    Planned,
}

/// A relationship as extracted from a turn, before the store assigns an id
/// and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDraft {
    pub subject: String,
    /// Schemaful uppercase label from the controlled vocabulary
    /// (WORKS_AT, VISITING, RETURNED_HOME, …), never free text.
    pub predicate: String,
    pub object: String,
    pub metadata: HashMap<String, Value>,
    pub status: Option<RelationshipStatus>,
    pub valid_until: Option<DateTime<Utc>>,
    pub source: FactSource,
    pub confidence: f64,
}

impl RelationshipDraft {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            metadata: HashMap::new(),
            status: None,
            valid_until: None,
            source: FactSource::UserStated,
            confidence: FactSource::UserStated.default_confidence(),
        }
    }

    pub fn with_source(mut self, source: FactSource) -> Self {
        self.source = source;
        self.confidence = source.default_confidence();
        self
    }

    pub fn statement(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// A persisted relationship: a directed, labeled edge with temporal and
/// supersession tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub status: Option<RelationshipStatus>,
    /// When set, the fact no longer applies after this instant.
    pub valid_until: Option<DateTime<Utc>>,
    /// Statement of the fact that replaced this one.  A superseded
    /// relationship always has `status = completed` and is excluded from
    /// retrieval.
    pub superseded_by: Option<String>,
    pub source: FactSource,
    pub confidence: f64,
}

impl Relationship {
    pub fn statement(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

// ── Structured extraction output ──────────────────────────────────────────────

/// What the extraction prompt yields for one side of a turn.  Parse failures
/// degrade to the empty value rather than aborting the turn.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub fact_type: FactType,
    pub entities: Vec<Entity>,
    pub relationships: Vec<RelationshipDraft>,
}

impl Extraction {
    /// Tolerant decode of model output: missing or malformed fields default,
    /// incomplete rows are skipped.
    pub fn from_value(value: &Value) -> Self {
        let fact_type = value
            .get("fact_type")
            .and_then(|v| v.as_str())
            .map(FactType::parse)
            .unwrap_or_default();

        let entities = value
            .get("entities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("name")?.as_str()?.trim();
                        if name.is_empty() {
                            return None;
                        }
                        let entity_type = item
                            .get("type")
                            .and_then(|v| v.as_str())
                            .map(EntityType::parse)
                            .unwrap_or(EntityType::Concept);
                        Some(Entity {
                            name: name.to_string(),
                            entity_type,
                            attributes: object_to_map(item.get("attributes")),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let relationships = value
            .get("relationships")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let subject = item.get("subject")?.as_str()?.trim();
                        let predicate = item.get("predicate")?.as_str()?.trim();
                        let object = item.get("object")?.as_str()?.trim();
                        if subject.is_empty() || predicate.is_empty() || object.is_empty() {
                            return None;
                        }
                        let mut draft = RelationshipDraft::new(subject, predicate, object);
                        draft.metadata = object_to_map(item.get("metadata"));
                        Some(draft)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            fact_type,
            entities,
            relationships,
        }
    }
}

fn object_to_map(value: Option<&Value>) -> HashMap<String, Value> {
    value
        .and_then(|v| v.as_object())
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn grade_parsing_accepts_both_scales() {
        assert_eq!(UtilityGrade::parse("DISCARD"), Some(UtilityGrade::Discard));
        assert_eq!(UtilityGrade::parse("store"), Some(UtilityGrade::Store));
        assert_eq!(UtilityGrade::parse(" High \n"), Some(UtilityGrade::High));
        assert_eq!(UtilityGrade::parse("absolutely important!"), None);
    }

    #[test]
    fn grade_scores_map_to_decay_tiers() {
        assert_eq!(UtilityGrade::Discard.score(), 0.0);
        assert_eq!(UtilityGrade::Low.score(), 0.3);
        assert_eq!(UtilityGrade::Store.score(), 0.6);
        assert_eq!(UtilityGrade::Medium.score(), 0.6);
        assert_eq!(UtilityGrade::Important.score(), 1.0);
        assert_eq!(UtilityGrade::High.score(), 1.0);
    }

    #[test]
    fn extraction_decodes_well_formed_output() {
        let value = json!({
            "fact_type": "core",
            "entities": [
                {"name": "User", "type": "Person", "attributes": {"work_hours": "9-5"}},
                {"name": "TechCorp", "type": "Organization", "attributes": {}}
            ],
            "relationships": [
                {"subject": "User", "predicate": "WORKS_AT", "object": "TechCorp",
                 "metadata": {"schedule": "9-5 weekdays"}}
            ]
        });
        let extraction = Extraction::from_value(&value);
        assert_eq!(extraction.fact_type, FactType::Core);
        assert_eq!(extraction.entities.len(), 2);
        assert_eq!(extraction.entities[1].entity_type, EntityType::Organization);
        assert_eq!(extraction.relationships.len(), 1);
        assert_eq!(
            extraction.relationships[0].statement(),
            "User WORKS_AT TechCorp"
        );
        assert_eq!(extraction.relationships[0].source, FactSource::UserStated);
        assert_eq!(extraction.relationships[0].confidence, 1.0);
    }

    #[test]
    fn extraction_skips_incomplete_rows_and_defaults_fact_type() {
        let value = json!({
            "entities": [
                {"name": "", "type": "Person"},
                {"type": "Place"},
                {"name": "Philadelphia", "type": "UnknownKind"}
            ],
            "relationships": [
                {"subject": "Mom", "predicate": "VISITING"},
                {"subject": "Mom", "predicate": "VISITING", "object": "Philadelphia"}
            ]
        });
        let extraction = Extraction::from_value(&value);
        assert_eq!(extraction.fact_type, FactType::Episodic);
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].entity_type, EntityType::Concept);
        assert_eq!(extraction.relationships.len(), 1);
    }

    #[test]
    fn assistant_source_carries_low_confidence() {
        let draft = RelationshipDraft::new("User", "WORKS_ON", "notes-app")
            .with_source(FactSource::AssistantInferred);
        assert_eq!(draft.confidence, 0.3);
    }
}
