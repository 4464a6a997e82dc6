//! The memory subsystem: dual-store persistence (vector + typed graph),
//! per-turn observer distillation, and budgeted context assembly.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Observer (per turn, background)                            │
//! │    grade → extract ∥ summarize ∥ queries → contradictions   │
//! │         → MemoryChunk (vector) ∥ entities+edges (graph)     │
//! │                                                             │
//! │  ContextAssembler (per turn, blocking)                      │
//! │    sliding window + vector leg ∥ graph leg                  │
//! │         → decay → merge → rerank → token-budgeted context   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assembler;
pub mod error;
pub mod graph;
pub mod graph_redb;
pub mod observer;
pub mod prompts;
pub mod qdrant;
pub mod schema;
pub mod vector;

pub use assembler::{ContextAssembler, HistoryMessage, RetrievalSource, RetrievedContext};
pub use error::MemoryError;
pub use graph::{GraphStats, GraphStore, InMemoryGraphStore};
pub use graph_redb::RedbGraphStore;
pub use observer::{ContradictionRecord, Observer, ObserverOutput, TemporalType};
pub use qdrant::QdrantVectorStore;
pub use schema::{
    ChunkType, Entity, EntityNode, EntityType, Extraction, FactSource, FactType, MemoryChunk,
    Relationship, RelationshipDraft, RelationshipStatus, UtilityGrade,
};
pub use vector::{InMemoryVectorStore, ScoredChunk, VectorStats, VectorStore};
