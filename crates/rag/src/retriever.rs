//! Hybrid retrieval with RRF fusion and prefetch.
//!
//! Dense and sparse searches run in parallel; reciprocal rank fusion
//! (k = 60) merges the candidate lists; the cascaded reranker produces the
//! final `fused_score` ordering, descending with doc_id ascending on ties.
//! Given identical query text and index state the ranked list is
//! byte-identical across calls.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use dhwani_config::RetrievalSettings;

use crate::embeddings::{cosine_distance, HashEmbedder};
use crate::reranker::CascadeReranker;
use crate::sparse::SparseIndex;
use crate::vector_store::VectorStore;
use crate::RagError;

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    pub top_k: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Dense,
    Sparse,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub doc_id: String,
    pub text: String,
    pub dense_score: f32,
    pub sparse_score: f32,
    pub rerank_score: f32,
    pub fused_score: f32,
    pub source: HitSource,
}

struct PrefetchEntry {
    partial_embedding: Vec<f32>,
    hits: Vec<RetrievalHit>,
    created: Instant,
}

const PREFETCH_TTL: Duration = Duration::from_secs(15);

/// Hybrid retriever; process-wide, shared across sessions.
pub struct HybridRetriever {
    embedder: Arc<HashEmbedder>,
    vector_store: Arc<dyn VectorStore>,
    sparse: Arc<SparseIndex>,
    reranker: Arc<CascadeReranker>,
    settings: RetrievalSettings,
    /// Configured Hindi/Hinglish synonym expansion, applied before search
    synonyms: HashMap<String, Vec<String>>,
    /// Speculative results keyed by (session_id, partial hash)
    prefetched: Mutex<HashMap<(String, u64), PrefetchEntry>>,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<HashEmbedder>,
        vector_store: Arc<dyn VectorStore>,
        sparse: Arc<SparseIndex>,
        reranker: Arc<CascadeReranker>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            sparse,
            reranker,
            settings,
            synonyms: HashMap::new(),
            prefetched: Mutex::new(HashMap::new()),
        }
    }

    /// Install configured synonym expansion (e.g. "byaj" → "interest").
    pub fn with_synonyms(mut self, synonyms: HashMap<String, Vec<String>>) -> Self {
        self.synonyms = synonyms;
        self
    }

    fn expand_query(&self, query: &str) -> String {
        if self.synonyms.is_empty() {
            return query.to_string();
        }
        let mut expanded = query.to_string();
        for word in query.to_lowercase().split_whitespace() {
            if let Some(extra) = self.synonyms.get(word) {
                for term in extra {
                    expanded.push(' ');
                    expanded.push_str(term);
                }
            }
        }
        expanded
    }

    /// Full pipeline: parallel dense + sparse → RRF to K1 → cascade rerank
    /// to K2. Budgeted at 50 ms end to end.
    pub async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, RagError> {
        let started = Instant::now();
        let expanded = self.expand_query(&query.text);

        let embedding = self.embedder.embed(&expanded);
        let dense_future = self.vector_store.search(&embedding, self.settings.top_k1);

        let sparse = self.sparse.clone();
        let sparse_query = expanded.clone();
        let sparse_k = self.settings.top_k1;
        let sparse_future = tokio::task::spawn_blocking(move || sparse.search(&sparse_query, sparse_k));

        let (dense_result, sparse_result) = tokio::join!(dense_future, sparse_future);
        let dense_hits = dense_result?;
        let sparse_hits = sparse_result
            .map_err(|e| RagError::Search(format!("sparse task failed: {}", e)))??;

        let fused = self.rrf_fuse(&dense_hits, &sparse_hits);
        let reranked = self
            .reranker
            .rerank(&query.text, fused, self.settings.top_k2)?;

        let mut hits = reranked;
        hits.truncate(query.top_k.min(self.settings.top_k2));

        metrics::histogram!("retrieval_seconds").record(started.elapsed().as_secs_f64());
        Ok(hits)
    }

    /// Reciprocal rank fusion with deterministic tie-breaks.
    fn rrf_fuse(
        &self,
        dense: &[crate::vector_store::ScoredDoc],
        sparse: &[crate::vector_store::ScoredDoc],
    ) -> Vec<RetrievalHit> {
        let k = self.settings.rrf_k;
        let mut merged: HashMap<String, RetrievalHit> = HashMap::new();

        for (rank, scored) in dense.iter().enumerate() {
            let rrf = 1.0 / (k + rank as f32 + 1.0);
            merged
                .entry(scored.doc.id.clone())
                .and_modify(|hit| {
                    hit.fused_score += rrf;
                    hit.dense_score = scored.score;
                    hit.source = HitSource::Hybrid;
                })
                .or_insert_with(|| RetrievalHit {
                    doc_id: scored.doc.id.clone(),
                    text: scored.doc.text.clone(),
                    dense_score: scored.score,
                    sparse_score: 0.0,
                    rerank_score: 0.0,
                    fused_score: rrf,
                    source: HitSource::Dense,
                });
        }

        for (rank, scored) in sparse.iter().enumerate() {
            let rrf = 1.0 / (k + rank as f32 + 1.0);
            merged
                .entry(scored.doc.id.clone())
                .and_modify(|hit| {
                    hit.fused_score += rrf;
                    hit.sparse_score = scored.score;
                    hit.source = HitSource::Hybrid;
                })
                .or_insert_with(|| RetrievalHit {
                    doc_id: scored.doc.id.clone(),
                    text: scored.doc.text.clone(),
                    dense_score: 0.0,
                    sparse_score: scored.score,
                    rerank_score: 0.0,
                    fused_score: rrf,
                    source: HitSource::Sparse,
                });
        }

        let mut fused: Vec<RetrievalHit> = merged.into_values().collect();
        fused.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        fused.truncate(self.settings.top_k1);
        fused
    }

    /// Speculative retrieval on a partial transcript. Fires once the
    /// partial carries enough tokens; results are cached per session keyed
    /// by the partial's hash.
    pub async fn prefetch(&self, session_id: &str, partial_text: &str) -> Result<(), RagError> {
        let tokens = partial_text.split_whitespace().count();
        if tokens < self.settings.prefetch_min_tokens {
            return Ok(());
        }

        let key = (session_id.to_string(), text_hash(partial_text));
        if self.prefetched.lock().contains_key(&key) {
            return Ok(());
        }

        let hits = self
            .search(&RetrievalQuery {
                text: partial_text.to_string(),
                top_k: self.settings.top_k2,
            })
            .await?;

        let entry = PrefetchEntry {
            partial_embedding: self.embedder.embed(partial_text),
            hits,
            created: Instant::now(),
        };
        let mut cache = self.prefetched.lock();
        cache.retain(|_, e| e.created.elapsed() < PREFETCH_TTL);
        cache.insert(key, entry);
        metrics::counter!("retrieval_prefetches_total").increment(1);
        Ok(())
    }

    /// Retrieve for the final transcript, reusing a prefetched result when
    /// the final's embedding lies within the configured cosine distance of
    /// the partial it was issued for; otherwise the speculation is
    /// discarded and the query re-issued.
    pub async fn search_final(
        &self,
        session_id: &str,
        final_text: &str,
    ) -> Result<Vec<RetrievalHit>, RagError> {
        let final_embedding = self.embedder.embed(final_text);

        let reused = {
            let mut cache = self.prefetched.lock();
            let mut best: Option<(u64, f32)> = None;
            for ((sid, hash), entry) in cache.iter() {
                if sid != session_id || entry.created.elapsed() >= PREFETCH_TTL {
                    continue;
                }
                let distance = cosine_distance(&final_embedding, &entry.partial_embedding);
                if distance <= self.settings.prefetch_max_distance {
                    match best {
                        Some((_, best_distance)) if best_distance <= distance => {}
                        _ => best = Some((*hash, distance)),
                    }
                }
            }
            let hit = best.and_then(|(hash, _)| {
                cache
                    .remove(&(session_id.to_string(), hash))
                    .map(|entry| entry.hits)
            });
            // Anything else cached for this session is stale speculation.
            cache.retain(|(sid, _), _| sid != session_id);
            hit
        };

        if let Some(hits) = reused {
            metrics::counter!("retrieval_prefetch_hits_total").increment(1);
            return Ok(hits);
        }

        self.search(&RetrievalQuery {
            text: final_text.to_string(),
            top_k: self.settings.top_k2,
        })
        .await
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::{Document, MemoryVectorStore};

    async fn retriever() -> HybridRetriever {
        let embedder = Arc::new(HashEmbedder::default());
        let store = Arc::new(MemoryVectorStore::new());
        let sparse = Arc::new(SparseIndex::in_ram().unwrap());

        let docs = vec![
            Document::new("rate-1", "gold loan annual interest rate is 9.5 percent"),
            Document::new("elig-1", "loan eligibility depends on gold weight and purity tier"),
            Document::new("sav-1", "balance transfer saves interest against higher competitor rates"),
            Document::new("br-1", "branches are open monday to saturday ten to six"),
        ];
        let rows: Vec<_> = docs
            .iter()
            .map(|d| (d.clone(), embedder.embed(&d.text)))
            .collect();
        store.upsert(rows).await.unwrap();
        sparse.add_documents(&docs).unwrap();

        HybridRetriever::new(
            embedder,
            store,
            sparse,
            Arc::new(CascadeReranker::lexical()),
            RetrievalSettings::default(),
        )
    }

    #[tokio::test]
    async fn hybrid_search_finds_relevant_doc() {
        let retriever = retriever().await;
        let hits = retriever
            .search(&RetrievalQuery {
                text: "interest rate for gold loan".to_string(),
                top_k: 3,
            })
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].doc_id, "rate-1");
        // Sorted by fused score descending.
        for pair in hits.windows(2) {
            assert!(pair[0].fused_score >= pair[1].fused_score);
        }
    }

    #[tokio::test]
    async fn identical_queries_are_byte_identical() {
        let retriever = retriever().await;
        let query = RetrievalQuery {
            text: "gold loan eligibility".to_string(),
            top_k: 4,
        };
        let a = retriever.search(&query).await.unwrap();
        let b = retriever.search(&query).await.unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.doc_id, y.doc_id);
            assert_eq!(x.fused_score.to_bits(), y.fused_score.to_bits());
        }
    }

    #[tokio::test]
    async fn prefetch_reused_for_similar_final() {
        let retriever = retriever().await;
        retriever
            .prefetch("session-1", "gold loan interest rate")
            .await
            .unwrap();
        assert_eq!(retriever.prefetched.lock().len(), 1);

        // Final transcript matching the partial: embeddings coincide and
        // the speculation is reused.
        let hits = retriever
            .search_final("session-1", "gold loan interest rate")
            .await
            .unwrap();
        assert_eq!(hits[0].doc_id, "rate-1");
        assert!(retriever.prefetched.lock().is_empty());
    }

    #[tokio::test]
    async fn prefetch_discarded_for_divergent_final() {
        let retriever = retriever().await;
        retriever
            .prefetch("session-1", "gold loan interest rate")
            .await
            .unwrap();

        let hits = retriever
            .search_final("session-1", "where is the nearest branch open")
            .await
            .unwrap();
        // Re-issued search reflects the final text, not the stale partial.
        assert_eq!(hits[0].doc_id, "br-1");
        assert!(retriever.prefetched.lock().is_empty());
    }

    #[tokio::test]
    async fn short_partials_do_not_prefetch() {
        let retriever = retriever().await;
        retriever.prefetch("session-1", "gold loan").await.unwrap();
        assert!(retriever.prefetched.lock().is_empty());
    }

    #[tokio::test]
    async fn synonym_expansion_improves_recall() {
        let retriever = retriever().await.with_synonyms(
            [("byaj".to_string(), vec!["interest".to_string(), "rate".to_string()])]
                .into_iter()
                .collect(),
        );
        let hits = retriever
            .search(&RetrievalQuery {
                text: "gold byaj".to_string(),
                top_k: 3,
            })
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.doc_id == "rate-1"));
    }
}
