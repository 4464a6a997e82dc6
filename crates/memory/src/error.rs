use std::fmt::Display;

/// Errors from the vector and graph stores.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The chunk's embedding length does not match the store dimension.
    /// Nothing is inserted.
    #[error("embedding length {actual} does not match store dimension {expected}")]
    SchemaMismatch { expected: usize, actual: usize },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl MemoryError {
    pub fn backend(err: impl Display) -> Self {
        MemoryError::Backend(err.to_string())
    }
}
