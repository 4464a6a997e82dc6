//! Embedded labeled-property-graph backend on [`redb`].
//!
//! Entities are nodes keyed by name, relationships are edges keyed by id;
//! both are stored as JSON values.  The database lives in a single file, so
//! "backend unreachable" means the file cannot be opened — the engine then
//! falls back to [`crate::InMemoryGraphStore`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::info;

use crate::error::MemoryError;
use crate::graph::{
    GraphStats, GraphStore, merge_entity, order_and_dedup, realize_draft, supersede_in_place,
};
use crate::schema::{Entity, EntityNode, Relationship, RelationshipDraft};

/// Entity nodes: `name (str) → json(EntityNode)`.
const ENTITIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
/// Relationship edges: `id (str) → json(Relationship)`.
const RELATIONSHIPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("relationships");

pub struct RedbGraphStore {
    db: Database,
    path: PathBuf,
}

impl RedbGraphStore {
    /// Open or create the graph database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(MemoryError::backend)?;
        }
        let db = Database::create(&path).map_err(MemoryError::backend)?;

        // Ensure tables exist so first reads don't fail.
        let tx = db.begin_write().map_err(MemoryError::backend)?;
        tx.open_table(ENTITIES_TABLE).map_err(MemoryError::backend)?;
        tx.open_table(RELATIONSHIPS_TABLE)
            .map_err(MemoryError::backend)?;
        tx.commit().map_err(MemoryError::backend)?;

        info!(path = %path.display(), "graph database opened");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn all_relationships(&self) -> Result<Vec<Relationship>, MemoryError> {
        let tx = self.db.begin_read().map_err(MemoryError::backend)?;
        let table = tx
            .open_table(RELATIONSHIPS_TABLE)
            .map_err(MemoryError::backend)?;
        let mut rels = Vec::new();
        for row in table.iter().map_err(MemoryError::backend)? {
            let (_, value) = row.map_err(MemoryError::backend)?;
            rels.push(serde_json::from_slice(value.value())?);
        }
        Ok(rels)
    }
}

#[async_trait]
impl GraphStore for RedbGraphStore {
    async fn persist_entities(&self, entities: &[Entity]) -> Result<(), MemoryError> {
        let tx = self.db.begin_write().map_err(MemoryError::backend)?;
        {
            let mut table = tx.open_table(ENTITIES_TABLE).map_err(MemoryError::backend)?;
            for entity in entities {
                let existing: Option<EntityNode> = {
                    let guard = table
                        .get(entity.name.as_str())
                        .map_err(MemoryError::backend)?;
                    match guard {
                        Some(value) => Some(serde_json::from_slice(value.value())?),
                        None => None,
                    }
                };
                let merged = merge_entity(existing, entity);
                let bytes = serde_json::to_vec(&merged)?;
                table
                    .insert(entity.name.as_str(), bytes.as_slice())
                    .map_err(MemoryError::backend)?;
            }
        }
        tx.commit().map_err(MemoryError::backend)?;
        Ok(())
    }

    async fn persist_relationships(
        &self,
        relationships: &[RelationshipDraft],
    ) -> Result<(), MemoryError> {
        let tx = self.db.begin_write().map_err(MemoryError::backend)?;
        {
            let mut table = tx
                .open_table(RELATIONSHIPS_TABLE)
                .map_err(MemoryError::backend)?;
            for draft in relationships {
                let rel = realize_draft(draft);
                let bytes = serde_json::to_vec(&rel)?;
                table
                    .insert(rel.id.as_str(), bytes.as_slice())
                    .map_err(MemoryError::backend)?;
            }
        }
        tx.commit().map_err(MemoryError::backend)?;
        Ok(())
    }

    async fn query(
        &self,
        subject: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>, MemoryError> {
        Ok(self
            .all_relationships()?
            .into_iter()
            .filter(|rel| rel.subject == subject)
            .filter(|rel| predicate.is_none_or(|p| rel.predicate == p))
            .collect())
    }

    async fn query_by_object(
        &self,
        object: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>, MemoryError> {
        Ok(self
            .all_relationships()?
            .into_iter()
            .filter(|rel| rel.object == object)
            .filter(|rel| predicate.is_none_or(|p| rel.predicate == p))
            .collect())
    }

    async fn search_relationships(
        &self,
        names: &[String],
        limit: usize,
    ) -> Result<Vec<Relationship>, MemoryError> {
        let matches: Vec<Relationship> = self
            .all_relationships()?
            .into_iter()
            .filter(|rel| names.contains(&rel.subject) || names.contains(&rel.object))
            .collect();
        Ok(order_and_dedup(matches, limit))
    }

    async fn mark_contradiction(
        &self,
        existing_id: &str,
        superseded_by: &str,
    ) -> Result<(), MemoryError> {
        let tx = self.db.begin_write().map_err(MemoryError::backend)?;
        {
            let mut table = tx
                .open_table(RELATIONSHIPS_TABLE)
                .map_err(MemoryError::backend)?;
            let existing: Option<Relationship> = {
                let guard = table.get(existing_id).map_err(MemoryError::backend)?;
                match guard {
                    Some(value) => Some(serde_json::from_slice(value.value())?),
                    None => None,
                }
            };
            if let Some(mut rel) = existing {
                if rel.superseded_by.is_none() {
                    supersede_in_place(&mut rel, superseded_by);
                    let bytes = serde_json::to_vec(&rel)?;
                    table
                        .insert(existing_id, bytes.as_slice())
                        .map_err(MemoryError::backend)?;
                }
            }
        }
        tx.commit().map_err(MemoryError::backend)?;
        Ok(())
    }

    async fn entity(&self, name: &str) -> Result<Option<EntityNode>, MemoryError> {
        let tx = self.db.begin_read().map_err(MemoryError::backend)?;
        let table = tx.open_table(ENTITIES_TABLE).map_err(MemoryError::backend)?;
        let guard = table.get(name).map_err(MemoryError::backend)?;
        match guard {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn stats(&self) -> Result<GraphStats, MemoryError> {
        let tx = self.db.begin_read().map_err(MemoryError::backend)?;
        let entities = tx
            .open_table(ENTITIES_TABLE)
            .map_err(MemoryError::backend)?
            .len()
            .map_err(MemoryError::backend)? as usize;
        let relationships = tx
            .open_table(RELATIONSHIPS_TABLE)
            .map_err(MemoryError::backend)?
            .len()
            .map_err(MemoryError::backend)? as usize;
        Ok(GraphStats {
            entities,
            relationships,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
