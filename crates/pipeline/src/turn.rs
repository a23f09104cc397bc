//! Hybrid end-of-turn detection.
//!
//! Two signals combine: elapsed silence since the last speech frame, and a
//! semantic completeness classifier over the latest transcript. End of turn
//! is declared when the semantics say the utterance is complete and a short
//! silence has passed, or unconditionally once silence reaches the
//! configured ceiling. At most one `EndOfTurn` fires per utterance.

use parking_lot::Mutex;

use dhwani_config::TurnSettings;
use dhwani_core::{Transcript, TurnEvent};

/// Semantic completeness of a partial utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Question,
    PossiblyComplete,
    Incomplete,
    Backchannel,
}

impl Completeness {
    /// Suggested silence window for the unconditional rule, before clamping.
    fn suggested_silence_ms(&self) -> u32 {
        match self {
            Completeness::Question => 400,
            Completeness::Complete => 500,
            Completeness::PossiblyComplete | Completeness::Backchannel => 700,
            Completeness::Incomplete => 900,
        }
    }
}

/// Heuristic completeness classifier.
///
/// Runs on the STT task at partial cadence; no model, so it is always
/// available and the silence rule remains the authoritative fallback.
pub struct SemanticClassifier {
    question_words: Vec<&'static str>,
    trailing_connectives: Vec<&'static str>,
    backchannels: Vec<&'static str>,
}

impl Default for SemanticClassifier {
    fn default() -> Self {
        Self {
            question_words: vec![
                "what", "how", "why", "when", "where", "which", "kya", "kitna", "kitni", "kaun",
                "kab", "kahan", "kaise", "क्या", "कितना", "कितनी", "कब", "कहां", "कैसे",
            ],
            trailing_connectives: vec![
                "and", "but", "or", "so", "because", "aur", "lekin", "par", "toh", "ki", "और",
                "लेकिन", "पर", "तो", "कि",
            ],
            backchannels: vec![
                "haan", "hmm", "ok", "okay", "achha", "yes", "no", "ji", "हाँ", "अच्छा", "जी",
                "ठीक",
            ],
        }
    }
}

impl SemanticClassifier {
    pub fn classify(&self, text: &str) -> (Completeness, f32) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return (Completeness::Incomplete, 0.9);
        }
        let lower = trimmed.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        if words.len() <= 2 && words.iter().all(|w| self.backchannels.contains(w)) {
            return (Completeness::Backchannel, 0.7);
        }

        let last_word = words.last().copied().unwrap_or("");
        if self.trailing_connectives.contains(&last_word) || trimmed.ends_with(',') {
            return (Completeness::Incomplete, 0.85);
        }

        let is_question = trimmed.ends_with('?')
            || words.iter().any(|w| self.question_words.contains(w));
        if is_question {
            return (Completeness::Question, 0.9);
        }

        if trimmed.ends_with('.')
            || trimmed.ends_with('!')
            || trimmed.ends_with('।')
            || words.len() >= 4
        {
            return (Completeness::Complete, 0.8);
        }

        (Completeness::PossiblyComplete, 0.6)
    }
}

struct DetectorState {
    last_speech_ms: Option<u64>,
    pending_final: Option<Transcript>,
    semantic_class: Option<Completeness>,
    semantic_confidence: f32,
    semantic_applies: bool,
    dynamic_eot_ms: u32,
    emitted: bool,
}

/// Consumes speech activity, partials, and the final transcript; the sole
/// component allowed to declare `EndOfTurn`.
pub struct TurnDetector {
    settings: TurnSettings,
    classifier: Option<SemanticClassifier>,
    state: Mutex<DetectorState>,
}

impl TurnDetector {
    pub fn new(settings: TurnSettings) -> Self {
        let classifier = settings
            .semantic_enabled
            .then(SemanticClassifier::default);
        let dynamic_eot_ms = settings.vad_eot_ms;
        Self {
            settings,
            classifier,
            state: Mutex::new(DetectorState {
                last_speech_ms: None,
                pending_final: None,
                semantic_class: None,
                semantic_confidence: 0.0,
                semantic_applies: false,
                dynamic_eot_ms,
                emitted: false,
            }),
        }
    }

    /// Record speech activity. Any speech re-arms the detector and voids a
    /// pending final: the user kept talking.
    pub fn note_speech(&self, ts_ms: u64) {
        let mut state = self.state.lock();
        state.last_speech_ms = Some(ts_ms);
        state.pending_final = None;
        state.emitted = false;
    }

    /// Feed the latest transcript (partial or final) through the semantic
    /// classifier.
    pub fn note_transcript(&self, transcript: &Transcript) {
        let mut state = self.state.lock();
        if transcript.is_final {
            state.pending_final = Some(transcript.clone());
        }

        if let Some(ref classifier) = self.classifier {
            let (class, confidence) = classifier.classify(&transcript.text);
            state.semantic_class = Some(class);
            state.semantic_confidence = confidence;
            // Punctuation- or whitespace-only text never satisfies the
            // semantic rule on its own.
            state.semantic_applies = !transcript.is_contentless()
                && matches!(class, Completeness::Complete | Completeness::Question);
            // Contentless text also gets no shortened silence window.
            state.dynamic_eot_ms = if transcript.is_contentless() {
                self.settings.vad_eot_ms
            } else {
                class
                    .suggested_silence_ms()
                    .clamp(self.settings.semantic_min_silence_ms * 2, self.settings.vad_eot_ms)
            };
        }
    }

    /// Evaluate the decision policy at `now_ms`. Emits `EndOfTurn` at most
    /// once per utterance, and only once the final transcript is in hand.
    pub fn evaluate(&self, now_ms: u64) -> TurnEvent {
        let mut state = self.state.lock();
        if state.emitted || state.pending_final.is_none() {
            return TurnEvent::ContinueListening;
        }
        let Some(last_speech) = state.last_speech_ms else {
            return TurnEvent::ContinueListening;
        };
        let silence_ms = now_ms.saturating_sub(last_speech);

        let semantic_fires = state.semantic_applies
            && state.semantic_confidence >= self.settings.semantic_threshold
            && silence_ms >= self.settings.semantic_min_silence_ms as u64;
        let silence_fires = silence_ms >= state.dynamic_eot_ms.min(self.settings.vad_eot_ms) as u64
            && silence_ms >= self.settings.semantic_min_silence_ms as u64
            || silence_ms >= self.settings.vad_eot_ms as u64;

        if semantic_fires || silence_fires {
            if let Some(final_transcript) = state.pending_final.take() {
                state.emitted = true;
                metrics::counter!("turns_detected_total").increment(1);
                return TurnEvent::EndOfTurn(final_transcript);
            }
        }
        TurnEvent::ContinueListening
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_speech_ms = None;
        state.pending_final = None;
        state.semantic_class = None;
        state.semantic_confidence = 0.0;
        state.semantic_applies = false;
        state.dynamic_eot_ms = self.settings.vad_eot_ms;
        state.emitted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn final_t(text: &str) -> Transcript {
        Transcript::partial(text, 0.9, 0, 1_000_000).into_final()
    }

    fn detector() -> TurnDetector {
        TurnDetector::new(TurnSettings::default())
    }

    #[test]
    fn silence_rule_declares_after_ceiling() {
        let det = detector();
        det.note_speech(1000);
        det.note_transcript(&final_t("mujhe loan chahiye tha aur"));

        // Trailing connective: incomplete, so only the ceiling applies.
        assert!(matches!(det.evaluate(1500), TurnEvent::ContinueListening));
        assert!(matches!(det.evaluate(1699), TurnEvent::ContinueListening));
        assert!(matches!(det.evaluate(1700), TurnEvent::EndOfTurn(_)));
    }

    #[test]
    fn semantic_rule_is_faster_for_questions() {
        let det = detector();
        det.note_speech(1000);
        det.note_transcript(&final_t("गोल्ड लोन का रेट क्या है?"));

        assert!(matches!(det.evaluate(1100), TurnEvent::ContinueListening));
        // 200 ms silence + high semantic confidence
        assert!(matches!(det.evaluate(1210), TurnEvent::EndOfTurn(_)));
    }

    #[test]
    fn punctuation_only_never_fires_semantically() {
        let det = detector();
        det.note_speech(1000);
        det.note_transcript(&final_t("..."));

        // Well past the semantic window but below the silence ceiling.
        assert!(matches!(det.evaluate(1400), TurnEvent::ContinueListening));
        assert!(matches!(det.evaluate(1701), TurnEvent::EndOfTurn(_)));
    }

    #[test]
    fn end_of_turn_fires_at_most_once() {
        let det = detector();
        det.note_speech(0);
        det.note_transcript(&final_t("बस इतना ही।"));
        assert!(matches!(det.evaluate(800), TurnEvent::EndOfTurn(_)));
        assert!(matches!(det.evaluate(900), TurnEvent::ContinueListening));
    }

    #[test]
    fn resumed_speech_voids_pending_final() {
        let det = detector();
        det.note_speech(0);
        det.note_transcript(&final_t("रुको"));
        det.note_speech(300);
        // The pending final was voided; no event until a new final arrives.
        assert!(matches!(det.evaluate(2000), TurnEvent::ContinueListening));
    }

    #[test]
    fn classifier_labels() {
        let c = SemanticClassifier::default();
        assert_eq!(c.classify("what is the rate?").0, Completeness::Question);
        assert_eq!(c.classify("mera loan hai aur").0, Completeness::Incomplete);
        assert_eq!(c.classify("haan").0, Completeness::Backchannel);
        assert_eq!(
            c.classify("main kal branch aana chahta hoon.").0,
            Completeness::Complete
        );
    }

    #[test]
    fn no_event_without_final() {
        let det = detector();
        det.note_speech(0);
        assert!(matches!(det.evaluate(5000), TurnEvent::ContinueListening));
    }
}
