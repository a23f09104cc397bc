//! Dense vector storage.
//!
//! Production targets Qdrant; the in-memory store backs tests and
//! single-node demos. Indexing jobs take the write half exclusively,
//! readers are wait-free between writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use qdrant_client::qdrant::{
    value::Kind, CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};

use crate::embeddings::cosine_distance;
use crate::RagError;

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub doc: Document,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, docs: Vec<(Document, Vec<f32>)>) -> Result<(), RagError>;
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<ScoredDoc>, RagError>;
}

/// In-memory cosine store.
#[derive(Default)]
pub struct MemoryVectorStore {
    rows: RwLock<Vec<(Document, Vec<f32>)>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, docs: Vec<(Document, Vec<f32>)>) -> Result<(), RagError> {
        let mut rows = self.rows.write();
        for (doc, embedding) in docs {
            if let Some(row) = rows.iter_mut().find(|(d, _)| d.id == doc.id) {
                *row = (doc, embedding);
            } else {
                rows.push((doc, embedding));
            }
        }
        Ok(())
    }

    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<ScoredDoc>, RagError> {
        let rows = self.rows.read();
        let mut scored: Vec<ScoredDoc> = rows
            .iter()
            .map(|(doc, row_embedding)| ScoredDoc {
                doc: doc.clone(),
                score: 1.0 - cosine_distance(embedding, row_embedding),
            })
            .collect();
        // Stable order: score desc, then id asc.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc.id.cmp(&b.doc.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Qdrant-backed store.
pub struct QdrantStore {
    client: Arc<Qdrant>,
    collection: String,
}

impl QdrantStore {
    pub fn new(url: &str, collection: impl Into<String>) -> Result<Self, RagError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| RagError::Store(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            collection: collection.into(),
        })
    }

    /// Create the collection if missing.
    pub async fn ensure_collection(&self, dim: usize) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| RagError::Store(e.to_string()))?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
                )
                .await
                .map_err(|e| RagError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, docs: Vec<(Document, Vec<f32>)>) -> Result<(), RagError> {
        let points: Vec<PointStruct> = docs
            .into_iter()
            .enumerate()
            .map(|(i, (doc, embedding))| {
                let mut payload = Payload::new();
                payload.insert("doc_id", doc.id.clone());
                payload.insert("text", doc.text.clone());
                for (k, v) in doc.metadata {
                    payload.insert(k, v);
                }
                PointStruct::new(i as u64, embedding, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await
            .map_err(|e| RagError::Store(e.to_string()))?;
        Ok(())
    }

    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<ScoredDoc>, RagError> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, embedding.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| RagError::Store(e.to_string()))?;

        let results = response
            .result
            .into_iter()
            .map(|point| {
                let get = |key: &str| match point.payload.get(key).and_then(|v| v.kind.clone()) {
                    Some(Kind::StringValue(s)) => s,
                    _ => String::new(),
                };
                ScoredDoc {
                    doc: Document::new(get("doc_id"), get("text")),
                    score: point.score,
                }
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;

    #[tokio::test]
    async fn memory_store_ranks_by_similarity() {
        let embedder = HashEmbedder::default();
        let store = MemoryVectorStore::new();
        let docs = vec![
            Document::new("a", "gold loan interest rate details"),
            Document::new("b", "branch opening hours"),
            Document::new("c", "gold loan eligibility rules"),
        ];
        let rows: Vec<_> = docs
            .into_iter()
            .map(|d| {
                let e = embedder.embed(&d.text);
                (d, e)
            })
            .collect();
        store.upsert(rows).await.unwrap();

        let query = embedder.embed("gold loan rate");
        let hits = store.search(&query, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc.id, "a");
    }

    #[tokio::test]
    async fn upsert_replaces_same_id() {
        let embedder = HashEmbedder::default();
        let store = MemoryVectorStore::new();
        let e = embedder.embed("old text");
        store
            .upsert(vec![(Document::new("x", "old text"), e)])
            .await
            .unwrap();
        let e2 = embedder.embed("new text");
        store
            .upsert(vec![(Document::new("x", "new text"), e2.clone())])
            .await
            .unwrap();

        let hits = store.search(&e2, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc.text, "new text");
    }
}
