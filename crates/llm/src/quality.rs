//! Response quality estimation.
//!
//! Combines token-level confidence when the backend reports one, an n-gram
//! repetition score, and configured stop-phrase detection. Thresholds come
//! from configuration. Short-but-valid answers are NOT penalized for
//! length alone; only emptiness and degenerate repetition count against a
//! response.

use std::collections::HashSet;

pub struct QualityEstimator {
    stop_phrases: Vec<String>,
}

impl QualityEstimator {
    pub fn new(stop_phrases: Vec<String>) -> Self {
        Self {
            stop_phrases: stop_phrases
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    /// Score in [0, 1]. `token_confidence` is the backend's own mean token
    /// probability, when available.
    pub fn score(&self, text: &str, token_confidence: Option<f32>) -> f32 {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return 0.0;
        }

        let lower = trimmed.to_lowercase();
        if self.stop_phrases.iter().any(|p| lower.contains(p)) {
            return 0.1;
        }

        let mut score: f32 = 1.0;

        // Degenerate repetition: distinct trigram ratio over the response.
        let words: Vec<&str> = lower.split_whitespace().collect();
        if words.len() >= 9 {
            let trigrams: Vec<&[&str]> = words.windows(3).collect();
            let distinct: HashSet<Vec<&str>> = trigrams.iter().map(|w| w.to_vec()).collect();
            let ratio = distinct.len() as f32 / trigrams.len() as f32;
            if ratio < 0.5 {
                score -= 0.5;
            } else if ratio < 0.75 {
                score -= 0.2;
            }
        }

        // Garbage detection: overwhelming share of symbol characters.
        let symbols = trimmed
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && *c != '।' && *c != '?' && *c != '!' && *c != ',' && *c != '.')
            .count();
        if symbols as f32 / trimmed.chars().count() as f32 > 0.3 {
            score -= 0.4;
        }

        if let Some(confidence) = token_confidence {
            score = score * 0.7 + confidence.clamp(0.0, 1.0) * 0.3;
        }

        score.clamp(0.0, 1.0)
    }
}
