//! Deterministic hashing embedder.
//!
//! Character n-grams are feature-hashed into a fixed-dimension vector and
//! L2-normalized. Identical text always embeds identically, which the
//! prefetch cosine gate and the determinism guarantees rely on. A learned
//! embedder can replace this behind the same signature; the vector store
//! only cares about the dimension.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const DEFAULT_DIM: usize = 384;

pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let lower = text.to_lowercase();

        for word in lower.split_whitespace() {
            let chars: Vec<char> = word.chars().collect();
            // Word-level feature plus 3-gram features.
            bump(&mut vector, word, 1.0);
            if chars.len() >= 3 {
                for gram in chars.windows(3) {
                    let gram: String = gram.iter().collect();
                    bump(&mut vector, &gram, 0.5);
                }
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

fn bump(vector: &mut [f32], feature: &str, weight: f32) {
    let mut hasher = DefaultHasher::new();
    feature.hash(&mut hasher);
    let hash = hasher.finish();
    let idx = (hash % vector.len() as u64) as usize;
    // Sign bit from a higher hash bit decorrelates collisions.
    let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
    vector[idx] += weight * sign;
}

/// Cosine distance in [0, 2]; 0 means identical direction.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (na * nb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("gold loan interest rate");
        let b = embedder.embed("gold loan interest rate");
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_is_normalized() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed("सोने पर लोन");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_text_is_closer_than_unrelated() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("gold loan interest rate");
        let b = embedder.embed("gold loan interest rates");
        let c = embedder.embed("cricket match score today");
        assert!(cosine_distance(&a, &b) < cosine_distance(&a, &c));
    }

    #[test]
    fn distance_of_identical_is_zero() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("namaste");
        assert!(cosine_distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn empty_text_has_unit_distance() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("");
        let b = embedder.embed("anything");
        assert_eq!(cosine_distance(&a, &b), 1.0);
    }
}
