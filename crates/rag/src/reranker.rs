//! Cascaded reranking.
//!
//! Stage one prunes the fused candidate list to K2 with a cheap lexical
//! score; stage two runs a cross-encoder over the survivors. Early exit
//! from intermediate encoder layers is NOT attempted: the exported model
//! graphs expose no per-layer outputs, so the cascade keeps the API shape
//! while running the full depth on the pruned set. Without a model the
//! lexical score stands in for the cross-encoder.

use crate::retriever::RetrievalHit;
use crate::RagError;

/// Weight of the rerank score in the final fused score; the RRF score
/// keeps the remainder so stage-one ordering still matters.
const RERANK_WEIGHT: f32 = 0.7;

pub struct CascadeReranker {
    #[cfg(feature = "onnx")]
    model: Option<CrossEncoderModel>,
}

impl CascadeReranker {
    /// Lexical-only cascade (no model weights).
    pub fn lexical() -> Self {
        Self {
            #[cfg(feature = "onnx")]
            model: None,
        }
    }

    #[cfg(feature = "onnx")]
    pub fn with_model(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, RagError> {
        Ok(Self {
            model: Some(CrossEncoderModel::new(model_path, tokenizer_path)?),
        })
    }

    /// Rerank fused candidates: prune to `k2`, score, fold the score into
    /// `fused_score`, and sort descending with doc_id as the tie-break.
    pub fn rerank(
        &self,
        query: &str,
        mut hits: Vec<RetrievalHit>,
        k2: usize,
    ) -> Result<Vec<RetrievalHit>, RagError> {
        // Stage 1: lexical pre-filter on keyword overlap.
        for hit in &mut hits {
            hit.rerank_score = lexical_score(query, &hit.text);
        }
        hits.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(k2.max(1));

        // Stage 2: cross-encoder over the survivors.
        #[cfg(feature = "onnx")]
        if let Some(ref model) = self.model {
            for hit in &mut hits {
                hit.rerank_score = model.score(query, &hit.text)?;
            }
        }

        for hit in &mut hits {
            hit.fused_score =
                hit.fused_score * (1.0 - RERANK_WEIGHT) + hit.rerank_score * RERANK_WEIGHT;
        }
        hits.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        Ok(hits)
    }
}

/// Keyword-overlap score in [0, 1]: fraction of query terms present in the
/// document, with a small length prior.
fn lexical_score(query: &str, document: &str) -> f32 {
    let doc_lower = document.to_lowercase();
    let query_lower = query.to_lowercase();
    let terms: Vec<&str> = query_lower
        .split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    let matched = terms.iter().filter(|t| doc_lower.contains(**t)).count();
    let overlap = matched as f32 / terms.len() as f32;
    // Mild preference for focused documents.
    let brevity = 1.0 / (1.0 + (document.len() as f32 / 2000.0));
    overlap * 0.9 + brevity * 0.1
}

/// MiniLM-style cross-encoder scored through ONNX Runtime.
#[cfg(feature = "onnx")]
pub struct CrossEncoderModel {
    session: parking_lot::Mutex<ort::session::Session>,
    tokenizer: tokenizers::Tokenizer,
}

#[cfg(feature = "onnx")]
impl CrossEncoderModel {
    pub fn new(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, RagError> {
        use ort::session::builder::GraphOptimizationLevel;
        let session = ort::session::Session::builder()
            .map_err(|e| RagError::Rerank(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RagError::Rerank(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| RagError::Rerank(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| RagError::Rerank(e.to_string()))?;
        let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path)
            .map_err(|e| RagError::Rerank(e.to_string()))?;
        Ok(Self {
            session: parking_lot::Mutex::new(session),
            tokenizer,
        })
    }

    pub fn score(&self, query: &str, document: &str) -> Result<f32, RagError> {
        use ort::value::Tensor;

        let encoding = self
            .tokenizer
            .encode((query, document), true)
            .map_err(|e| RagError::Rerank(e.to_string()))?;
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&i| i as i64).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&i| i as i64)
            .collect();
        let len = ids.len();

        let ids = ndarray::Array2::from_shape_vec((1, len), ids)
            .map_err(|e| RagError::Rerank(e.to_string()))?;
        let mask = ndarray::Array2::from_shape_vec((1, len), mask)
            .map_err(|e| RagError::Rerank(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input_ids" => Tensor::from_array(ids).map_err(|e| RagError::Rerank(e.to_string()))?,
                "attention_mask" => Tensor::from_array(mask).map_err(|e| RagError::Rerank(e.to_string()))?,
            ])
            .map_err(|e| RagError::Rerank(e.to_string()))?;

        let (_, logits) = outputs
            .get("logits")
            .ok_or_else(|| RagError::Rerank("missing logits output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| RagError::Rerank(e.to_string()))?;

        let raw = logits.first().copied().unwrap_or(0.0);
        Ok(1.0 / (1.0 + (-raw).exp()))
    }
}
