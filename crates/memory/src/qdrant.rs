//! Qdrant-backed vector store: one collection of memory chunks with cosine
//! distance, all §-metadata carried in the point payload.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointId, PointStruct, ScoredPoint, ScrollPointsBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use tracing::{debug, info, warn};

use crate::error::MemoryError;
use crate::schema::{ChunkType, FactType, MemoryChunk};
use crate::vector::{
    ScoredChunk, VectorStats, VectorStore, oversample, rank_by_combined_score, tally_utility,
};

pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    dim: usize,
}

impl QdrantVectorStore {
    /// Connect and ensure the collection exists.  Errors here are fatal at
    /// startup — the vector store is a required component.
    pub async fn connect(
        url: &str,
        collection: impl Into<String>,
        dim: usize,
    ) -> Result<Self, MemoryError> {
        let client = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .map_err(MemoryError::backend)?;
        let store = Self {
            client,
            collection: collection.into(),
            dim,
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<(), MemoryError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(MemoryError::backend)?;
        if exists {
            return Ok(());
        }

        info!(collection = %self.collection, dim = self.dim, "creating vector collection");
        match self
            .client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(self.dim as u64, Distance::Cosine)),
            )
            .await
        {
            Ok(_) => Ok(()),
            // Another process may have created it between our check and
            // create call.
            Err(err) if err.to_string().contains("already exists") => {
                debug!(collection = %self.collection, "collection created concurrently");
                Ok(())
            }
            Err(err) => Err(MemoryError::backend(err)),
        }
    }

    fn payload(chunk: &MemoryChunk) -> HashMap<String, QdrantValue> {
        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert("content".to_string(), chunk.content.clone().into());
        payload.insert("summary".to_string(), chunk.summary.clone().into());
        payload.insert(
            "chunk_type".to_string(),
            chunk.chunk_type.as_str().to_string().into(),
        );
        payload.insert(
            "source_conversation_id".to_string(),
            chunk.source_conversation_id.clone().into(),
        );
        payload.insert("turn_index".to_string(), chunk.turn_index.into());
        payload.insert(
            "created_at".to_string(),
            chunk.created_at.to_rfc3339().into(),
        );
        payload.insert(
            "last_accessed_at".to_string(),
            chunk.last_accessed_at.to_rfc3339().into(),
        );
        payload.insert(
            "access_count".to_string(),
            (chunk.access_count as i64).into(),
        );
        payload.insert(
            "retrieval_queries".to_string(),
            chunk.retrieval_queries.join("\n").into(),
        );
        payload.insert("utility_score".to_string(), chunk.utility_score.into());
        payload.insert(
            "fact_type".to_string(),
            chunk.fact_type.as_str().to_string().into(),
        );
        payload
    }

    fn point_to_chunk(point: ScoredPoint) -> Option<MemoryChunk> {
        let id = point.id.as_ref().map(point_id_string)?;
        let payload = point.payload;

        let content = payload.get("content")?.as_str()?.to_string();
        let summary = payload
            .get("summary")
            .and_then(|v| v.as_str())
            .map(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let chunk_type = payload
            .get("chunk_type")
            .and_then(|v| v.as_str())
            .map(|s| ChunkType::parse(s.as_str()))
            .unwrap_or(ChunkType::Conversation);
        let source_conversation_id = payload
            .get("source_conversation_id")
            .and_then(|v| v.as_str())
            .map(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let turn_index = payload
            .get("turn_index")
            .and_then(|v| v.as_integer())
            .unwrap_or(0);
        let created_at = payload
            .get("created_at")
            .and_then(|v| v.as_str())
            .map(|s| parse_timestamp(s.as_str()))
            .unwrap_or_else(Utc::now);
        let last_accessed_at = payload
            .get("last_accessed_at")
            .and_then(|v| v.as_str())
            .map(|s| parse_timestamp(s.as_str()))
            .unwrap_or(created_at);
        let access_count = payload
            .get("access_count")
            .and_then(|v| v.as_integer())
            .unwrap_or(0)
            .max(0) as u32;
        let retrieval_queries = payload
            .get("retrieval_queries")
            .and_then(|v| v.as_str())
            .map(|joined| {
                joined
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let utility_score = payload
            .get("utility_score")
            .and_then(|v| v.as_double())
            .unwrap_or(0.5);
        let fact_type = payload
            .get("fact_type")
            .and_then(|v| v.as_str())
            .map(|s| FactType::parse(s.as_str()))
            .unwrap_or_default();

        let embedding = point.vectors.and_then(|v| match v.vectors_options {
            Some(qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(vec)) => {
                match vec.into_vector() {
                    qdrant_client::qdrant::vector_output::Vector::Dense(dense) => Some(dense.data),
                    _ => None,
                }
            }
            _ => None,
        })?;

        Some(MemoryChunk {
            id,
            content,
            summary,
            embedding,
            chunk_type,
            source_conversation_id,
            turn_index,
            created_at,
            last_accessed_at,
            access_count,
            retrieval_queries,
            utility_score,
            fact_type,
        })
    }

    /// Write back refreshed access metadata for the returned chunks.  Best
    /// effort: a failure degrades the bookkeeping, not the search.
    async fn touch(&self, chunks: &[MemoryChunk]) {
        if chunks.is_empty() {
            return;
        }
        let points: Vec<PointStruct> = chunks
            .iter()
            .map(|chunk| {
                PointStruct::new(
                    chunk.id.clone(),
                    chunk.embedding.clone(),
                    Self::payload(chunk),
                )
            })
            .collect();
        if let Err(err) = self
            .client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await
        {
            warn!(error = %err, "failed to refresh access metadata");
        }
    }
}

fn point_id_string(id: &qdrant_client::qdrant::PointId) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match &id.point_id_options {
        Some(PointIdOptions::Uuid(uuid)) => uuid.clone(),
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn persist(&self, chunk: MemoryChunk) -> Result<(), MemoryError> {
        if chunk.embedding.len() != self.dim {
            return Err(MemoryError::SchemaMismatch {
                expected: self.dim,
                actual: chunk.embedding.len(),
            });
        }

        let point = PointStruct::new(
            chunk.id.clone(),
            chunk.embedding.clone(),
            Self::payload(&chunk),
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(MemoryError::backend)?;
        debug!(id = %chunk.id, "memory chunk persisted");
        Ok(())
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, MemoryError> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(
                    &self.collection,
                    vector.to_vec(),
                    oversample(top_k) as u64,
                )
                .with_payload(true)
                .with_vectors(true),
            )
            .await
            .map_err(MemoryError::backend)?;

        let candidates: Vec<MemoryChunk> = response
            .result
            .into_iter()
            .filter_map(Self::point_to_chunk)
            .collect();

        let mut hits = rank_by_combined_score(candidates, top_k);

        let now = Utc::now();
        for hit in &mut hits {
            hit.chunk.last_accessed_at = now;
            hit.chunk.access_count += 1;
        }
        let touched: Vec<MemoryChunk> = hits.iter().map(|hit| hit.chunk.clone()).collect();
        self.touch(&touched).await;

        Ok(hits)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(MemoryError::backend)?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or_default() as usize)
    }

    async fn stats(&self) -> Result<VectorStats, MemoryError> {
        // Scroll the whole collection, payload only, 100 points per page.
        let mut scores = Vec::new();
        let mut offset: Option<PointId> = None;
        let page_size = 100u32;

        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection)
                .limit(page_size)
                .with_payload(true)
                .with_vectors(false);
            if let Some(ref off) = offset {
                builder = builder.offset(off.clone());
            }

            let response = self
                .client
                .scroll(builder)
                .await
                .map_err(MemoryError::backend)?;
            if response.result.is_empty() {
                break;
            }

            for point in &response.result {
                let utility = point
                    .payload
                    .get("utility_score")
                    .and_then(|v| v.as_double())
                    .unwrap_or(0.5);
                scores.push(utility);
            }

            offset = response.result.last().and_then(|point| point.id.clone());
            if response.result.len() < page_size as usize {
                break;
            }
        }

        Ok(tally_utility(&scores))
    }
}
