//! Language tags and multilingual text utilities.
//!
//! Token estimation must never count bytes for Indic scripts: a Devanagari
//! conjunct like "श्री" is one grapheme but nine UTF-8 bytes. All counting
//! here goes through grapheme clusters.

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Languages the agent converses in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Language {
    #[serde(rename = "hi")]
    Hindi,
    #[default]
    #[serde(rename = "en")]
    English,
    /// Code-mixed Hindi/English
    #[serde(rename = "hi-en")]
    Hinglish,
    #[serde(rename = "ta")]
    Tamil,
    #[serde(rename = "te")]
    Telugu,
    #[serde(rename = "kn")]
    Kannada,
    #[serde(rename = "ml")]
    Malayalam,
}

impl Language {
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Hindi => "hi",
            Language::English => "en",
            Language::Hinglish => "hi-en",
            Language::Tamil => "ta",
            Language::Telugu => "te",
            Language::Kannada => "kn",
            Language::Malayalam => "ml",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "hi" => Some(Language::Hindi),
            "en" => Some(Language::English),
            "hi-en" => Some(Language::Hinglish),
            "ta" => Some(Language::Tamil),
            "te" => Some(Language::Telugu),
            "kn" => Some(Language::Kannada),
            "ml" => Some(Language::Malayalam),
            _ => None,
        }
    }

    /// Classify text by dominant script. Mixed Devanagari + Latin becomes
    /// Hinglish; pure Latin stays English.
    pub fn detect(text: &str) -> Self {
        let mut devanagari = 0usize;
        let mut tamil = 0usize;
        let mut telugu = 0usize;
        let mut kannada = 0usize;
        let mut malayalam = 0usize;
        let mut latin = 0usize;

        for c in text.chars() {
            match c as u32 {
                0x0900..=0x097F => devanagari += 1,
                0x0B80..=0x0BFF => tamil += 1,
                0x0C00..=0x0C7F => telugu += 1,
                0x0C80..=0x0CFF => kannada += 1,
                0x0D00..=0x0D7F => malayalam += 1,
                _ if c.is_ascii_alphabetic() => latin += 1,
                _ => {}
            }
        }

        let max_south = tamil.max(telugu).max(kannada).max(malayalam);
        if max_south > devanagari && max_south > latin {
            if max_south == tamil {
                return Language::Tamil;
            } else if max_south == telugu {
                return Language::Telugu;
            } else if max_south == kannada {
                return Language::Kannada;
            }
            return Language::Malayalam;
        }
        if devanagari > 0 && latin > 0 {
            Language::Hinglish
        } else if devanagari > 0 {
            Language::Hindi
        } else {
            Language::English
        }
    }
}

/// Count grapheme clusters.
pub fn grapheme_count(text: &str) -> usize {
    text.graphemes(true).count()
}

/// Truncate to at most `max_graphemes` clusters without splitting one.
pub fn truncate_graphemes(text: &str, max_graphemes: usize) -> &str {
    match text.grapheme_indices(true).nth(max_graphemes) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Language-aware token estimate used for context-window budgeting.
///
/// Devanagari-dominant text runs around two graphemes per model token;
/// Latin text around four. Sampling graphemes rather than bytes keeps the
/// estimate stable across scripts.
pub fn estimate_tokens(text: &str) -> usize {
    let graphemes = grapheme_count(text);
    if graphemes == 0 {
        return 0;
    }
    let indic = text
        .chars()
        .filter(|c| matches!(*c as u32, 0x0900..=0x0D7F))
        .count();
    if indic > graphemes / 3 {
        (graphemes / 2).max(1)
    } else {
        (graphemes / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_scripts() {
        assert_eq!(Language::detect("नमस्ते"), Language::Hindi);
        assert_eq!(Language::detect("hello there"), Language::English);
        assert_eq!(Language::detect("mujhe लोन chahiye"), Language::Hinglish);
        assert_eq!(Language::detect("வணக்கம்"), Language::Tamil);
        assert_eq!(Language::detect("నమస్కారం"), Language::Telugu);
    }

    #[test]
    fn tag_roundtrip() {
        for lang in [
            Language::Hindi,
            Language::English,
            Language::Hinglish,
            Language::Tamil,
            Language::Telugu,
            Language::Kannada,
            Language::Malayalam,
        ] {
            assert_eq!(Language::from_tag(lang.tag()), Some(lang));
        }
    }

    #[test]
    fn conjuncts_count_as_single_graphemes() {
        // "श्रीमान" is 4 grapheme clusters but 7 chars / 21 bytes.
        assert_eq!(grapheme_count("श्रीमान"), 4);
        assert!(estimate_tokens("श्रीमान") < "श्रीमान".len() / 4);
    }

    #[test]
    fn truncation_never_splits_graphemes() {
        let text = "श्रीमान जी";
        let cut = truncate_graphemes(text, 3);
        assert_eq!(cut, "श्रीमा");
        assert!(text.starts_with(cut));
        // Cutting past the end returns the full string.
        assert_eq!(truncate_graphemes(text, 100), text);
    }

    #[test]
    fn token_estimate_nonzero_for_short_text() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hi") >= 1);
    }
}
