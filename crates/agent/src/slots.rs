//! Slot extraction and the per-session slot store.
//!
//! Extraction patterns are declared in `config/domain/slots.yaml` and
//! compiled exactly once here; the classifier and the extractor share the
//! same compiled set. Numeric normalization handles Devanagari digits,
//! common Hindi number words, and Indian units (lakh, crore, tola, kilo).
//! Extraction is pure: running it twice over the same text yields the same
//! values with the same confidences.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use dhwani_config::{DomainConfig, SlotDef, SlotKind};

/// A filled slot. Updates never lower confidence for the same source turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotValue {
    pub value: String,
    pub confidence: f32,
    pub source_turn: usize,
}

/// Per-session slot map keyed by canonical name.
#[derive(Debug, Default)]
pub struct SlotStore {
    slots: HashMap<String, SlotValue>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, canonical_name: &str) -> Option<&SlotValue> {
        self.slots.get(canonical_name)
    }

    pub fn get_f64(&self, canonical_name: &str) -> Option<f64> {
        self.get(canonical_name).and_then(|s| s.value.parse().ok())
    }

    /// Replace only when the new value is at least as confident.
    pub fn update(&mut self, canonical_name: &str, value: SlotValue) {
        match self.slots.get(canonical_name) {
            Some(existing) if existing.confidence > value.confidence => {
                tracing::trace!(
                    slot = canonical_name,
                    "kept higher-confidence slot value"
                );
            }
            _ => {
                self.slots.insert(canonical_name.to_string(), value);
            }
        }
    }

    pub fn merge(&mut self, extracted: HashMap<String, SlotValue>) {
        for (name, value) in extracted {
            self.update(&name, value);
        }
    }

    pub fn as_facts(&self) -> Vec<String> {
        let mut facts: Vec<String> = self
            .slots
            .iter()
            .map(|(name, slot)| format!("{}: {}", name, slot.value))
            .collect();
        facts.sort();
        facts
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

struct CompiledSlot {
    def: SlotDef,
    patterns: Vec<Regex>,
}

/// Config-driven extractor; compiled once per process.
pub struct SlotExtractor {
    slots: Vec<CompiledSlot>,
    lender_aliases: Vec<(String, String)>,
}

impl SlotExtractor {
    pub fn new(domain: &Arc<DomainConfig>) -> Result<Self, dhwani_core::Error> {
        let mut slots = Vec::with_capacity(domain.slots.len());
        for def in &domain.slots {
            let mut patterns = Vec::with_capacity(def.patterns.len());
            for raw in &def.patterns {
                let compiled = Regex::new(raw).map_err(|e| {
                    dhwani_core::Error::config(format!(
                        "slot {} pattern {:?}: {}",
                        def.canonical_name, raw, e
                    ))
                })?;
                patterns.push(compiled);
            }
            slots.push(CompiledSlot {
                def: def.clone(),
                patterns,
            });
        }

        // Lender detection runs off the competitor table's aliases.
        let mut lender_aliases = Vec::new();
        for competitor in &domain.competitors {
            lender_aliases.push((competitor.name.clone(), competitor.name.clone()));
            for alias in &competitor.aliases {
                lender_aliases.push((alias.clone(), competitor.name.clone()));
            }
        }

        Ok(Self {
            slots,
            lender_aliases,
        })
    }

    /// Extract every slot present in the utterance.
    pub fn extract(&self, utterance: &str, source_turn: usize) -> HashMap<String, SlotValue> {
        let normalized = normalize_numerals(utterance);
        let mut found = HashMap::new();

        for slot in &self.slots {
            for pattern in &slot.patterns {
                if let Some(captures) = pattern.captures(&normalized) {
                    let Some(raw) = captures.get(1) else { continue };
                    let full_match = captures.get(0).map(|m| m.as_str()).unwrap_or("");
                    if let Some(value) =
                        interpret(&slot.def, raw.as_str(), full_match)
                    {
                        found.insert(
                            slot.def.canonical_name.clone(),
                            SlotValue {
                                value,
                                confidence: 0.9,
                                source_turn,
                            },
                        );
                        break;
                    }
                }
            }
        }

        // current_lender: substring match on the competitor aliases.
        let lower = normalized.to_lowercase();
        for (alias, canonical) in &self.lender_aliases {
            if lower.contains(alias.as_str()) {
                found.insert(
                    "current_lender".to_string(),
                    SlotValue {
                        value: canonical.clone(),
                        confidence: 0.85,
                        source_turn,
                    },
                );
                break;
            }
        }

        found
    }
}

fn interpret(def: &SlotDef, raw: &str, full_match: &str) -> Option<String> {
    match def.kind {
        SlotKind::Decimal | SlotKind::Integer => {
            let number: f64 = raw.replace(',', "").parse().ok()?;
            let scaled = number * unit_multiplier(full_match);
            if def.kind == SlotKind::Integer {
                Some(((scaled).round() as i64).to_string())
            } else if scaled.fract() == 0.0 {
                Some(format!("{}", scaled as i64))
            } else {
                Some(format!("{}", scaled))
            }
        }
        SlotKind::Phone => {
            let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
            (digits.len() == 10 && digits.starts_with(['6', '7', '8', '9'])).then_some(digits)
        }
        SlotKind::Enum => {
            let upper = raw.to_uppercase();
            def.enum_values
                .iter()
                .find(|v| v.starts_with(&upper) || **v == format!("{}K", upper))
                .cloned()
        }
        SlotKind::Text | SlotKind::Date => Some(raw.trim().to_string()),
    }
}

/// Unit multiplier read from the matched text around the number.
fn unit_multiplier(matched: &str) -> f64 {
    let lower = matched.to_lowercase();
    if lower.contains("crore") || lower.contains("करोड़") || lower.contains(" cr") {
        10_000_000.0
    } else if lower.contains("lakh") || lower.contains("lac") || lower.contains("लाख") {
        100_000.0
    } else if lower.contains("thousand") || lower.contains("hazar") || lower.contains("हज़ार") {
        1_000.0
    } else if lower.contains("tola") || lower.contains("तोला") {
        11.66
    } else if lower.contains("kilo") || lower.contains("kg") || lower.contains("किलो") {
        1_000.0
    } else if lower.contains("year") || lower.contains("saal") || lower.contains("साल") {
        12.0
    } else {
        1.0
    }
}

/// Map Devanagari digits to ASCII and spell common Hindi number words as
/// digits. Ambiguous Latin homographs ("do", "char") are left alone.
pub fn normalize_numerals(text: &str) -> String {
    let digits_mapped: String = text
        .chars()
        .map(|c| match c as u32 {
            // Devanagari ०-९
            0x0966..=0x096F => char::from_digit(c as u32 - 0x0966, 10).unwrap_or(c),
            _ => c,
        })
        .collect();

    let word_map: [(&str, &str); 16] = [
        ("एक", "1"),
        ("दो", "2"),
        ("तीन", "3"),
        ("चार", "4"),
        ("पांच", "5"),
        ("पाँच", "5"),
        ("छह", "6"),
        ("सात", "7"),
        ("आठ", "8"),
        ("नौ", "9"),
        ("दस", "10"),
        ("बीस", "20"),
        ("बाईस", "22"),
        ("पचास", "50"),
        ("paanch", "5"),
        ("bais", "22"),
    ];

    digits_mapped
        .split_whitespace()
        .map(|word| {
            word_map
                .iter()
                .find(|(from, _)| *from == word)
                .map(|(_, to)| *to)
                .unwrap_or(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> SlotExtractor {
        SlotExtractor::new(&Arc::new(DomainConfig::builtin())).unwrap()
    }

    #[test]
    fn savings_scenario_slots() {
        let extractor = extractor();
        let slots = extractor.extract("मेरा 5 लाख का लोन है, 22% पर", 1);
        assert_eq!(slots["outstanding_amount"].value, "500000");
        assert_eq!(slots["current_rate"].value, "22");
    }

    #[test]
    fn extraction_is_idempotent() {
        let extractor = extractor();
        let text = "mera 5 lakh ka loan muthoot me hai, 22 percent par";
        let first = extractor.extract(text, 3);
        let second = extractor.extract(text, 3);
        assert_eq!(first, second);
    }

    #[test]
    fn devanagari_digits_normalize() {
        assert_eq!(normalize_numerals("२२ प्रतिशत"), "22 प्रतिशत");
        assert_eq!(normalize_numerals("पाँच लाख"), "5 लाख");
        assert_eq!(normalize_numerals("paanch lakh"), "5 lakh");
    }

    #[test]
    fn hindi_number_words_feed_amounts() {
        let extractor = extractor();
        let slots = extractor.extract("पाँच लाख चाहिए", 0);
        assert_eq!(slots["outstanding_amount"].value, "500000");
    }

    #[test]
    fn weight_units_convert() {
        let extractor = extractor();
        let slots = extractor.extract("mere paas 50 gram sona hai", 0);
        assert_eq!(slots["gold_weight_grams"].value, "50");

        let slots = extractor.extract("10 tola gold", 0);
        let grams: f64 = slots["gold_weight_grams"].value.parse().unwrap();
        assert!((grams - 116.6).abs() < 0.1);
    }

    #[test]
    fn phone_and_pincode() {
        let extractor = extractor();
        let slots = extractor.extract("mera number 9876543210 hai aur pincode hai 400001", 0);
        assert_eq!(slots["phone_number"].value, "9876543210");
        assert_eq!(slots["pincode"].value, "400001");
    }

    #[test]
    fn lender_detected_from_aliases() {
        let extractor = extractor();
        let slots = extractor.extract("abhi muthut finance me loan chal raha hai", 0);
        assert_eq!(slots["current_lender"].value, "muthoot");
    }

    #[test]
    fn store_keeps_higher_confidence() {
        let mut store = SlotStore::new();
        store.update(
            "outstanding_amount",
            SlotValue {
                value: "500000".into(),
                confidence: 0.9,
                source_turn: 1,
            },
        );
        // A later, vaguer mention must not clobber the confident value.
        store.update(
            "outstanding_amount",
            SlotValue {
                value: "5".into(),
                confidence: 0.4,
                source_turn: 2,
            },
        );
        assert_eq!(store.get("outstanding_amount").unwrap().value, "500000");

        // Equal-or-better confidence replaces.
        store.update(
            "outstanding_amount",
            SlotValue {
                value: "600000".into(),
                confidence: 0.95,
                source_turn: 3,
            },
        );
        assert_eq!(store.get("outstanding_amount").unwrap().value, "600000");
    }

    #[test]
    fn tenure_in_years_scales_to_months() {
        let extractor = extractor();
        let slots = extractor.extract("2 saal ke liye chahiye", 0);
        assert_eq!(slots["tenure_months"].value, "24");
    }
}
