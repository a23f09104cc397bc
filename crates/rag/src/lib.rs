//! Retrieval core: hybrid dense/sparse search with reciprocal-rank fusion,
//! a cascaded reranker, and speculative prefetch keyed on partial
//! transcripts. End-to-end budget for K1=50, K2=10 is 50 ms.

pub mod embeddings;
pub mod reranker;
pub mod retriever;
pub mod sparse;
pub mod vector_store;

use thiserror::Error;

pub use embeddings::{cosine_distance, HashEmbedder};
pub use reranker::CascadeReranker;
pub use retriever::{HitSource, HybridRetriever, RetrievalHit, RetrievalQuery};
pub use sparse::SparseIndex;
pub use vector_store::{Document, MemoryVectorStore, QdrantStore, ScoredDoc, VectorStore};

#[derive(Debug, Error)]
pub enum RagError {
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("rerank error: {0}")]
    Rerank(String),
}

impl From<RagError> for dhwani_core::Error {
    fn from(err: RagError) -> Self {
        dhwani_core::Error::inference("retrieval", err.to_string())
    }
}
