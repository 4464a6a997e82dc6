//! Graph-store capability: typed entities and directed, labeled
//! relationships with temporal status and supersession tracking.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::MemoryError;
use crate::schema::{Entity, EntityNode, Relationship, RelationshipDraft, RelationshipStatus};

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    pub entities: usize,
    pub relationships: usize,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert entities by name: `first_mentioned` is set on first insert,
    /// `last_mentioned` refreshed on every call, attribute maps merged with
    /// new keys winning on conflict.
    async fn persist_entities(&self, entities: &[Entity]) -> Result<(), MemoryError>;

    /// Append relationships.  Draft defaults already carry
    /// `source = user_stated`, `confidence = 1.0`; the store assigns id and
    /// `created_at` and leaves `status = null` unless the draft set one.
    async fn persist_relationships(
        &self,
        relationships: &[RelationshipDraft],
    ) -> Result<(), MemoryError>;

    /// Relationships whose subject matches, optionally filtered by predicate.
    async fn query(
        &self,
        subject: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>, MemoryError>;

    /// Symmetric to [`GraphStore::query`]: match on the object side.
    async fn query_by_object(
        &self,
        object: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>, MemoryError>;

    /// Relationships where subject OR object is in `names`, newest first,
    /// deduplicated by (subject, predicate, object), at most `limit`.
    async fn search_relationships(
        &self,
        names: &[String],
        limit: usize,
    ) -> Result<Vec<Relationship>, MemoryError>;

    /// Supersede an existing relationship in place: `status = completed`,
    /// `superseded_by` = the replacing statement, and
    /// `metadata.still_valid/superseded_at` stamped.  Idempotent — a second
    /// call leaves the record untouched.  Accepts ids that arrive as numeric
    /// strings from the contradiction prompt.
    async fn mark_contradiction(
        &self,
        existing_id: &str,
        superseded_by: &str,
    ) -> Result<(), MemoryError>;

    async fn entity(&self, name: &str) -> Result<Option<EntityNode>, MemoryError>;

    async fn stats(&self) -> Result<GraphStats, MemoryError>;
}

/// Merge upsert shared by both backends.
pub(crate) fn merge_entity(existing: Option<EntityNode>, incoming: &Entity) -> EntityNode {
    let now = Utc::now();
    match existing {
        Some(mut node) => {
            node.entity_type = incoming.entity_type;
            node.last_mentioned = now;
            for (key, value) in &incoming.attributes {
                node.attributes.insert(key.clone(), value.clone());
            }
            node
        }
        None => EntityNode {
            name: incoming.name.clone(),
            entity_type: incoming.entity_type,
            attributes: incoming.attributes.clone(),
            first_mentioned: now,
            last_mentioned: now,
        },
    }
}

pub(crate) fn realize_draft(draft: &RelationshipDraft) -> Relationship {
    Relationship {
        id: Uuid::new_v4().to_string(),
        subject: draft.subject.clone(),
        predicate: draft.predicate.clone(),
        object: draft.object.clone(),
        metadata: draft.metadata.clone(),
        created_at: Utc::now(),
        status: draft.status,
        valid_until: draft.valid_until,
        superseded_by: None,
        source: draft.source,
        confidence: draft.confidence.clamp(0.0, 1.0),
    }
}

pub(crate) fn supersede_in_place(rel: &mut Relationship, superseded_by: &str) {
    rel.status = Some(RelationshipStatus::Completed);
    rel.superseded_by = Some(superseded_by.to_string());
    rel.metadata
        .insert("still_valid".to_string(), Value::Bool(false));
    rel.metadata.insert(
        "superseded_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
}

/// Newest first, deduplicated by (subject, predicate, object), truncated.
pub(crate) fn order_and_dedup(mut matches: Vec<Relationship>, limit: usize) -> Vec<Relationship> {
    matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut found = Vec::new();
    for rel in matches {
        let key = (rel.subject.clone(), rel.predicate.clone(), rel.object.clone());
        if !seen.insert(key) {
            continue;
        }
        found.push(rel);
        if found.len() >= limit {
            break;
        }
    }
    found
}

// ── In-memory backend ─────────────────────────────────────────────────────────

#[derive(Default)]
struct GraphInner {
    entities: HashMap<String, EntityNode>,
    relationships: Vec<Relationship>,
}

/// Fallback backend used when the persistent graph database cannot be
/// opened.  Same observable semantics as [`crate::RedbGraphStore`].
#[derive(Default)]
pub struct InMemoryGraphStore {
    inner: Mutex<GraphInner>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn persist_entities(&self, entities: &[Entity]) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock().await;
        for entity in entities {
            let existing = inner.entities.remove(&entity.name);
            inner
                .entities
                .insert(entity.name.clone(), merge_entity(existing, entity));
        }
        Ok(())
    }

    async fn persist_relationships(
        &self,
        relationships: &[RelationshipDraft],
    ) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock().await;
        for draft in relationships {
            inner.relationships.push(realize_draft(draft));
        }
        Ok(())
    }

    async fn query(
        &self,
        subject: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>, MemoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .relationships
            .iter()
            .filter(|rel| rel.subject == subject)
            .filter(|rel| predicate.is_none_or(|p| rel.predicate == p))
            .cloned()
            .collect())
    }

    async fn query_by_object(
        &self,
        object: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>, MemoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .relationships
            .iter()
            .filter(|rel| rel.object == object)
            .filter(|rel| predicate.is_none_or(|p| rel.predicate == p))
            .cloned()
            .collect())
    }

    async fn search_relationships(
        &self,
        names: &[String],
        limit: usize,
    ) -> Result<Vec<Relationship>, MemoryError> {
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let inner = self.inner.lock().await;
        let matches: Vec<Relationship> = inner
            .relationships
            .iter()
            .filter(|rel| names.contains(rel.subject.as_str()) || names.contains(rel.object.as_str()))
            .cloned()
            .collect();
        Ok(order_and_dedup(matches, limit))
    }

    async fn mark_contradiction(
        &self,
        existing_id: &str,
        superseded_by: &str,
    ) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(rel) = inner
            .relationships
            .iter_mut()
            .find(|rel| rel.id == existing_id)
        {
            if rel.superseded_by.is_none() {
                supersede_in_place(rel, superseded_by);
            }
        }
        Ok(())
    }

    async fn entity(&self, name: &str) -> Result<Option<EntityNode>, MemoryError> {
        Ok(self.inner.lock().await.entities.get(name).cloned())
    }

    async fn stats(&self) -> Result<GraphStats, MemoryError> {
        let inner = self.inner.lock().await;
        Ok(GraphStats {
            entities: inner.entities.len(),
            relationships: inner.relationships.len(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::{EntityType, FactSource};

    fn entity(name: &str, attributes: &[(&str, &str)]) -> Entity {
        Entity {
            name: name.to_string(),
            entity_type: EntityType::Person,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn entity_upsert_merges_attributes_and_advances_last_mentioned() {
        let store = InMemoryGraphStore::new();
        store
            .persist_entities(&[entity("Sarah", &[("role", "engineer")])])
            .await
            .unwrap();
        let first = store.entity("Sarah").await.unwrap().unwrap();

        store
            .persist_entities(&[entity("Sarah", &[("role", "manager"), ("age", "31")])])
            .await
            .unwrap();
        let second = store.entity("Sarah").await.unwrap().unwrap();

        // New keys win on conflict, old keys survive.
        assert_eq!(second.attributes["role"], json!("manager"));
        assert_eq!(second.attributes["age"], json!("31"));
        assert_eq!(second.first_mentioned, first.first_mentioned);
        assert!(second.last_mentioned >= first.last_mentioned);
    }

    #[tokio::test]
    async fn relationship_defaults_fill_on_append() {
        let store = InMemoryGraphStore::new();
        store
            .persist_relationships(&[RelationshipDraft::new("User", "WORKS_AT", "Acme")])
            .await
            .unwrap();

        let rels = store.query("User", Some("WORKS_AT")).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].source, FactSource::UserStated);
        assert_eq!(rels[0].confidence, 1.0);
        assert_eq!(rels[0].status, None);
        assert!(rels[0].superseded_by.is_none());
    }

    #[tokio::test]
    async fn query_filters_by_predicate_and_side() {
        let store = InMemoryGraphStore::new();
        store
            .persist_relationships(&[
                RelationshipDraft::new("User", "WORKS_AT", "Acme"),
                RelationshipDraft::new("User", "LIVES_IN", "Philadelphia"),
                RelationshipDraft::new("Sarah", "WORKS_AT", "Acme"),
            ])
            .await
            .unwrap();

        assert_eq!(store.query("User", None).await.unwrap().len(), 2);
        assert_eq!(store.query("User", Some("WORKS_AT")).await.unwrap().len(), 1);
        let by_object = store.query_by_object("Acme", None).await.unwrap();
        assert_eq!(by_object.len(), 2);
        assert_eq!(
            store
                .query_by_object("Acme", Some("LIVES_IN"))
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn search_is_newest_first_deduplicated_and_limited() {
        let store = InMemoryGraphStore::new();
        store
            .persist_relationships(&[RelationshipDraft::new("Mom", "VISITING", "Philadelphia")])
            .await
            .unwrap();
        store
            .persist_relationships(&[RelationshipDraft::new("Mom", "LIVES_IN", "West Boylston")])
            .await
            .unwrap();
        // Duplicate triple — must collapse to the newest copy.
        store
            .persist_relationships(&[RelationshipDraft::new("Mom", "VISITING", "Philadelphia")])
            .await
            .unwrap();

        let found = store
            .search_relationships(&["Mom".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].statement(), "Mom VISITING Philadelphia");
        assert_eq!(found[1].statement(), "Mom LIVES_IN West Boylston");

        let limited = store
            .search_relationships(&["Mom".to_string()], 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn mark_contradiction_supersedes_in_place_and_is_idempotent() {
        let store = InMemoryGraphStore::new();
        store
            .persist_relationships(&[RelationshipDraft::new("User", "WORKS_AT", "Acme")])
            .await
            .unwrap();
        let id = store.query("User", None).await.unwrap()[0].id.clone();

        store
            .mark_contradiction(&id, "User WORKS_AT NewCorp")
            .await
            .unwrap();
        let rel = store.query("User", None).await.unwrap().remove(0);
        assert_eq!(rel.status, Some(RelationshipStatus::Completed));
        assert_eq!(rel.superseded_by.as_deref(), Some("User WORKS_AT NewCorp"));
        assert_eq!(rel.metadata["still_valid"], json!(false));
        let stamped = rel.metadata["superseded_at"].clone();

        // Second call is a no-op with respect to status/superseded_by.
        store
            .mark_contradiction(&id, "User WORKS_AT SomewhereElse")
            .await
            .unwrap();
        let rel = store.query("User", None).await.unwrap().remove(0);
        assert_eq!(rel.superseded_by.as_deref(), Some("User WORKS_AT NewCorp"));
        assert_eq!(rel.metadata["superseded_at"], stamped);
    }

    #[tokio::test]
    async fn mark_contradiction_on_unknown_id_is_a_no_op() {
        let store = InMemoryGraphStore::new();
        store
            .mark_contradiction("42", "User WORKS_AT NewCorp")
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().relationships, 0);
    }
}
