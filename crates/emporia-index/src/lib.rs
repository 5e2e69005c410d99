mod embedder;
mod persist;
mod service;
mod vector;

pub use embedder::{Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIM, DEFAULT_EMBEDDING_MODEL};
pub use persist::{load_artifacts, save_artifacts};
pub use service::{SearchService, DEFAULT_MIN_SCORE};
pub use vector::VectorIndex;

use emporia_catalog::CatalogError;
use thiserror::Error;

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index not initialized")]
    NotInitialized,
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("vector/product count mismatch: {vectors} vectors for {products} products")]
    CountMismatch { vectors: usize, products: usize },
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("index artifact error: {0}")]
    Artifact(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
