//! Intent classification.
//!
//! Each configured intent carries regex patterns plus keyword and
//! Hindi/Hinglish synonym lists. Patterns are compiled once at startup.
//! One primary intent is chosen per user turn; regex hits dominate,
//! keyword hits accumulate.

use std::sync::Arc;

use regex::Regex;

use dhwani_config::DomainConfig;

#[derive(Debug, Clone)]
pub struct Intent {
    pub name: String,
    pub confidence: f32,
    /// Canonical names of slots this intent expects and the turn supplied
    pub extracted_slots: Vec<String>,
}

struct CompiledIntent {
    name: String,
    patterns: Vec<Regex>,
    keywords: Vec<String>,
    required_slots: Vec<String>,
}

pub struct IntentClassifier {
    intents: Vec<CompiledIntent>,
}

impl IntentClassifier {
    pub fn new(domain: &Arc<DomainConfig>) -> Result<Self, dhwani_core::Error> {
        let mut intents = Vec::with_capacity(domain.intents.len());
        for def in &domain.intents {
            let mut patterns = Vec::with_capacity(def.patterns.len());
            for raw in &def.patterns {
                let compiled = Regex::new(raw).map_err(|e| {
                    dhwani_core::Error::config(format!(
                        "intent {} pattern {:?}: {}",
                        def.name, raw, e
                    ))
                })?;
                patterns.push(compiled);
            }
            let keywords = def
                .keywords
                .iter()
                .chain(def.hindi_synonyms.iter())
                .map(|k| k.to_lowercase())
                .collect();
            intents.push(CompiledIntent {
                name: def.name.clone(),
                patterns,
                keywords,
                required_slots: def.required_slots.clone(),
            });
        }
        Ok(Self { intents })
    }

    /// Pick the primary intent for a user turn. `available_slots` holds the
    /// canonical slot names the extractor found in the same text.
    pub fn classify(&self, text: &str, available_slots: &[String]) -> Intent {
        let lower = text.to_lowercase();
        let mut best: Option<(&CompiledIntent, f32)> = None;

        for intent in &self.intents {
            let mut score = 0.0f32;

            if intent.patterns.iter().any(|p| p.is_match(text) || p.is_match(&lower)) {
                score += 0.6;
            }
            let keyword_hits = intent
                .keywords
                .iter()
                .filter(|k| lower.contains(k.as_str()))
                .count();
            score += (keyword_hits as f32 * 0.15).min(0.3);

            // A turn that supplies this intent's slots is strong evidence.
            let slot_hits = intent
                .required_slots
                .iter()
                .filter(|s| available_slots.contains(s))
                .count();
            if !intent.required_slots.is_empty() && slot_hits == intent.required_slots.len() {
                score += 0.2;
            }

            if score > 0.0 {
                match best {
                    Some((_, best_score)) if best_score >= score => {}
                    _ => best = Some((intent, score)),
                }
            }
        }

        match best {
            Some((intent, score)) => Intent {
                name: intent.name.clone(),
                confidence: score.min(1.0),
                extracted_slots: intent
                    .required_slots
                    .iter()
                    .filter(|s| available_slots.contains(s))
                    .cloned()
                    .collect(),
            },
            None => Intent {
                name: "unknown".to_string(),
                confidence: 0.0,
                extracted_slots: Vec::new(),
            },
        }
    }
}
