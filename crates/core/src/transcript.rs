//! Transcripts and the speech/turn event vocabulary.

use serde::{Deserialize, Serialize};

use crate::language::Language;

/// Voice-activity event, emitted per analysis window at 100 Hz or better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    /// Smoothed probability crossed the enter threshold for the hangover.
    SpeechStart { ts_us: u64, probability: f32 },
    /// Speech continues.
    SpeechOngoing { ts_us: u64, probability: f32 },
    /// Smoothed probability stayed below the exit threshold for the hangover.
    SpeechEnd { ts_us: u64, probability: f32 },
}

impl VadEvent {
    pub fn ts_us(&self) -> u64 {
        match self {
            VadEvent::SpeechStart { ts_us, .. }
            | VadEvent::SpeechOngoing { ts_us, .. }
            | VadEvent::SpeechEnd { ts_us, .. } => *ts_us,
        }
    }
}

/// Incremental transcription result.
///
/// Within one utterance, partials either extend the previous partial's text
/// as a prefix or carry `is_revision = true`. Exactly one final is emitted
/// per utterance, only after the matching `SpeechEnd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub tokens: Vec<String>,
    /// Mean frame confidence in [0, 1]
    pub confidence: f32,
    pub start_ts_us: u64,
    pub end_ts_us: u64,
    pub is_final: bool,
    /// Set when this partial rewrites rather than extends the previous one
    pub is_revision: bool,
    /// Set on finals rejected by the hallucination guard; text is empty
    pub low_confidence: bool,
    pub language: Language,
}

impl Transcript {
    pub fn partial(text: impl Into<String>, confidence: f32, start_ts_us: u64, end_ts_us: u64) -> Self {
        let text = text.into();
        let language = Language::detect(&text);
        Self {
            tokens: text.split_whitespace().map(str::to_string).collect(),
            text,
            confidence,
            start_ts_us,
            end_ts_us,
            is_final: false,
            is_revision: false,
            low_confidence: false,
            language,
        }
    }

    pub fn into_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn revised(mut self) -> Self {
        self.is_revision = true;
        self
    }

    /// True when the text holds nothing but punctuation and whitespace.
    /// Such transcripts never satisfy the semantic end-of-turn rule.
    pub fn is_contentless(&self) -> bool {
        self.text
            .chars()
            .all(|c| c.is_whitespace() || c.is_ascii_punctuation() || c == '।' || c == '॥')
    }
}

/// Decision of the turn detector; at most one `EndOfTurn` per utterance.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    EndOfTurn(Transcript),
    ContinueListening,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_detects_language() {
        let t = Transcript::partial("गोल्ड लोन", 0.9, 0, 100);
        assert_eq!(t.language, Language::Hindi);
        assert!(!t.is_final);
    }

    #[test]
    fn contentless_detection() {
        assert!(Transcript::partial("  ... ।", 0.4, 0, 0).is_contentless());
        assert!(Transcript::partial("", 0.0, 0, 0).is_contentless());
        assert!(!Transcript::partial("ok", 0.9, 0, 0).is_contentless());
    }

    #[test]
    fn final_flag() {
        let t = Transcript::partial("hello", 0.8, 0, 10).into_final();
        assert!(t.is_final);
    }
}
