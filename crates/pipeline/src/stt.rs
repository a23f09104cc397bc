//! Streaming speech-to-text.
//!
//! Audio between `SpeechStart` and `SpeechEnd` is decoded incrementally;
//! a partial is emitted on each decode step and exactly one final after the
//! utterance closes. Partials extend the previous text as a prefix or are
//! flagged as revisions. Finals whose mean frame confidence falls below the
//! configured floor are replaced by an empty, low-confidence-flagged
//! transcript rather than hallucinated text.

use parking_lot::Mutex;
use std::sync::Arc;

use dhwani_config::SttSettings;
use dhwani_core::{AudioFrame, Transcript};

use crate::PipelineError;

/// One incremental decode result covering the utterance so far.
#[derive(Debug, Clone)]
pub struct DecodeStep {
    /// Cumulative text for the current utterance
    pub text: String,
    /// Mean frame confidence so far
    pub confidence: f32,
}

/// Incremental decoder backend. Implementations are process-wide and shared
/// across sessions; per-utterance state lives in [`StreamingStt`].
pub trait SttDecode: Send + Sync {
    /// Decode with `audio` being the full utterance so far. Returns `None`
    /// when the step produced nothing new.
    fn decode(&self, audio: &[f32]) -> Result<Option<DecodeStep>, PipelineError>;
}

/// Tracks the partial-transcript contract for one utterance.
///
/// Successive updates must extend the previous text; anything else is a
/// revision and flagged as such.
pub struct PartialTracker {
    last_text: String,
    start_ts_us: u64,
}

impl PartialTracker {
    pub fn new(start_ts_us: u64) -> Self {
        Self {
            last_text: String::new(),
            start_ts_us,
        }
    }

    pub fn update(&mut self, text: &str, confidence: f32, now_us: u64) -> Transcript {
        let is_revision = !text.starts_with(&self.last_text);
        self.last_text = text.to_string();
        let partial = Transcript::partial(text, confidence, self.start_ts_us, now_us);
        if is_revision {
            partial.revised()
        } else {
            partial
        }
    }

    pub fn last_text(&self) -> &str {
        &self.last_text
    }
}

struct UtteranceState {
    audio: Vec<f32>,
    tracker: PartialTracker,
    samples_since_decode: usize,
    last_confidence: f32,
    active: bool,
    finalized: bool,
    decode_failures: u64,
}

/// Streaming STT front-end: buffers frames, paces decode steps, enforces
/// the partial/final contract.
pub struct StreamingStt {
    backend: Arc<dyn SttDecode>,
    settings: SttSettings,
    state: Mutex<UtteranceState>,
}

impl StreamingStt {
    pub fn new(backend: Arc<dyn SttDecode>, settings: SttSettings) -> Self {
        Self {
            backend,
            settings,
            state: Mutex::new(UtteranceState {
                audio: Vec::new(),
                tracker: PartialTracker::new(0),
                samples_since_decode: 0,
                last_confidence: 0.0,
                active: false,
                finalized: false,
                decode_failures: 0,
            }),
        }
    }

    /// Open an utterance at `SpeechStart`.
    pub fn begin_utterance(&self, start_ts_us: u64) {
        let mut state = self.state.lock();
        state.audio.clear();
        state.tracker = PartialTracker::new(start_ts_us);
        state.samples_since_decode = 0;
        state.last_confidence = 0.0;
        state.active = true;
        state.finalized = false;
    }

    /// Feed a frame; returns a partial when a decode step fires.
    ///
    /// A failed decode step skips the frame, bumps a counter, and emits no
    /// partial; the session orchestrator escalates on repeated failures.
    pub fn push(&self, frame: &AudioFrame) -> Result<Option<Transcript>, PipelineError> {
        // Copy out what the decode needs; never hold the lock across decode.
        let (audio, due, now_us) = {
            let mut state = self.state.lock();
            if !state.active {
                return Ok(None);
            }
            state.audio.extend_from_slice(&frame.samples);
            state.samples_since_decode += frame.samples.len();
            let interval_samples =
                (frame.sample_rate.as_u32() as usize * self.settings.decode_interval_ms as usize)
                    / 1000;
            let due = state.samples_since_decode >= interval_samples;
            if due {
                state.samples_since_decode = 0;
            }
            (
                due.then(|| state.audio.clone()),
                due,
                frame.capture_ts_us + frame.duration_ms() * 1000,
            )
        };

        if !due {
            return Ok(None);
        }
        let audio = audio.unwrap_or_default();

        match self.backend.decode(&audio) {
            Ok(Some(step)) => {
                let mut state = self.state.lock();
                state.last_confidence = step.confidence;
                let partial = state.tracker.update(&step.text, step.confidence, now_us);
                metrics::counter!("stt_partials_total").increment(1);
                Ok(Some(partial))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                let mut state = self.state.lock();
                state.decode_failures += 1;
                metrics::counter!("stt_decode_failures_total").increment(1);
                tracing::warn!("stt decode step failed, frame skipped: {}", e);
                Ok(None)
            }
        }
    }

    /// Close the utterance after `SpeechEnd`; returns the single final.
    ///
    /// The hallucination guard rejects finals with mean confidence below
    /// the configured floor, returning empty text with the low-confidence
    /// flag set.
    pub fn finalize(&self, end_ts_us: u64) -> Result<Transcript, PipelineError> {
        let audio = {
            let mut state = self.state.lock();
            if !state.active || state.finalized {
                return Err(PipelineError::Stt(
                    "finalize without an open utterance".to_string(),
                ));
            }
            state.finalized = true;
            state.active = false;
            state.audio.clone()
        };

        // One last decode over the complete utterance.
        let step = self.backend.decode(&audio).unwrap_or(None);

        let mut state = self.state.lock();
        if let Some(step) = step {
            state.last_confidence = step.confidence;
            state.tracker.last_text = step.text;
        }
        let text = state.tracker.last_text().to_string();
        let confidence = state.last_confidence;
        let start_ts_us = state.tracker.start_ts_us;
        drop(state);

        if confidence < self.settings.min_final_confidence {
            let mut rejected = Transcript::partial("", confidence, start_ts_us, end_ts_us).into_final();
            rejected.low_confidence = true;
            tracing::debug!(confidence, "final rejected by hallucination guard");
            return Ok(rejected);
        }

        Ok(Transcript::partial(text, confidence, start_ts_us, end_ts_us).into_final())
    }

    pub fn decode_failures(&self) -> u64 {
        self.state.lock().decode_failures
    }
}

/// CTC beam search over per-frame logit rows.
///
/// Token 0 is blank. Returns the best label sequence (repeats collapsed,
/// blanks removed) and the mean per-frame probability of the chosen labels.
pub fn ctc_beam_search(logits: &[Vec<f32>], beam_width: usize) -> (Vec<u32>, f32) {
    if logits.is_empty() {
        return (Vec::new(), 0.0);
    }

    // Beams keyed by collapsed sequence, scored by log probability.
    let mut beams: Vec<(Vec<u32>, f32, u32)> = vec![(Vec::new(), 0.0, 0)];
    let mut frame_confidence = 0.0f32;

    for row in logits {
        let probs = softmax(row);
        frame_confidence += probs.iter().cloned().fold(f32::MIN, f32::max);

        let mut candidates: Vec<(Vec<u32>, f32, u32)> = Vec::new();
        for (seq, score, last) in &beams {
            for (token, &p) in probs.iter().enumerate() {
                if p < 1e-6 {
                    continue;
                }
                let token = token as u32;
                let mut seq = seq.clone();
                // Collapse: blank emits nothing, repeats of the previous
                // label emit nothing.
                if token != 0 && token != *last {
                    seq.push(token);
                }
                candidates.push((seq, score + p.ln(), token));
            }
        }

        // Merge candidates with identical sequences, keep the best beams.
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        candidates.dedup_by(|a, b| a.0 == b.0);
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(beam_width.max(1));
        beams = candidates;
    }

    let best = beams.into_iter().next().unwrap_or_default();
    (best.0, frame_confidence / logits.len() as f32)
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().cloned().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// ONNX conformer decoder: encoder over the utterance audio, CTC beam
/// search over the logits, tokenizer decode to text.
#[cfg(feature = "onnx")]
pub struct OnnxDecoder {
    session: Mutex<ort::session::Session>,
    tokenizer: tokenizers::Tokenizer,
    beam_width: usize,
}

#[cfg(feature = "onnx")]
impl OnnxDecoder {
    /// Load failure here is fatal at startup (`ModelLoad`).
    pub fn new(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        beam_width: usize,
    ) -> Result<Self, PipelineError> {
        use ort::session::builder::GraphOptimizationLevel;
        let session = ort::session::Session::builder()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path)
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            beam_width,
        })
    }
}

#[cfg(feature = "onnx")]
impl SttDecode for OnnxDecoder {
    fn decode(&self, audio: &[f32]) -> Result<Option<DecodeStep>, PipelineError> {
        if audio.is_empty() {
            return Ok(None);
        }
        let input = ndarray::Array2::from_shape_vec((1, audio.len()), audio.to_vec())
            .map_err(|e| PipelineError::Stt(e.to_string()))?;
        let input_tensor = ort::value::Tensor::from_array(input)
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs!["audio" => input_tensor])
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let (shape, data) = outputs
            .get("logits")
            .ok_or_else(|| PipelineError::Model("missing logits output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if dims.len() < 3 {
            return Err(PipelineError::Stt(format!(
                "unexpected logits shape {:?}",
                dims
            )));
        }
        let (frames, vocab) = (dims[1], dims[2]);
        let rows: Vec<Vec<f32>> = (0..frames)
            .map(|f| data[f * vocab..(f + 1) * vocab].to_vec())
            .collect();

        let (ids, confidence) = ctc_beam_search(&rows, self.beam_width);
        let text = self
            .tokenizer
            .decode(&ids, true)
            .map_err(|e| PipelineError::Stt(e.to_string()))?;
        Ok(Some(DecodeStep { text, confidence }))
    }
}

/// Decoder that emits nothing; stands in when no model is configured.
pub struct NullDecoder;

impl SttDecode for NullDecoder {
    fn decode(&self, _audio: &[f32]) -> Result<Option<DecodeStep>, PipelineError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhwani_core::{Language, SampleRate, FRAME_SAMPLES};

    /// Emits a scripted prefix-extending transcript proportional to the
    /// amount of audio seen.
    struct ScriptedDecoder {
        words: Vec<&'static str>,
        confidence: f32,
    }

    impl SttDecode for ScriptedDecoder {
        fn decode(&self, audio: &[f32]) -> Result<Option<DecodeStep>, PipelineError> {
            let n = (audio.len() / 3200).min(self.words.len());
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(DecodeStep {
                text: self.words[..n].join(" "),
                confidence: self.confidence,
            }))
        }
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.1; FRAME_SAMPLES], SampleRate::Hz16000, seq, seq * 10_000)
    }

    fn stt(confidence: f32) -> StreamingStt {
        StreamingStt::new(
            Arc::new(ScriptedDecoder {
                words: vec!["गोल्ड", "लोन", "के", "बारे", "में"],
                confidence,
            }),
            SttSettings::default(),
        )
    }

    #[test]
    fn partials_are_prefix_extending() {
        let stt = stt(0.9);
        stt.begin_utterance(0);
        let mut partials: Vec<Transcript> = Vec::new();
        for seq in 0..100 {
            if let Some(p) = stt.push(&frame(seq)).unwrap() {
                partials.push(p);
            }
        }
        assert!(partials.len() > 1);
        for pair in partials.windows(2) {
            assert!(
                pair[1].text.starts_with(&pair[0].text) || pair[1].is_revision,
                "partial {:?} must extend {:?} or be a revision",
                pair[1].text,
                pair[0].text
            );
        }
    }

    #[test]
    fn exactly_one_final_after_end() {
        let stt = stt(0.9);
        stt.begin_utterance(0);
        for seq in 0..100 {
            stt.push(&frame(seq)).unwrap();
        }
        let final_t = stt.finalize(1_000_000).unwrap();
        assert!(final_t.is_final);
        assert_eq!(final_t.language, Language::Hindi);
        assert!(!final_t.text.is_empty());
        // A second finalize is a contract violation.
        assert!(stt.finalize(1_000_001).is_err());
    }

    #[test]
    fn hallucination_guard_rejects_low_confidence() {
        let stt = stt(0.2);
        stt.begin_utterance(0);
        for seq in 0..100 {
            stt.push(&frame(seq)).unwrap();
        }
        let final_t = stt.finalize(1_000_000).unwrap();
        assert!(final_t.is_final);
        assert!(final_t.low_confidence);
        assert!(final_t.text.is_empty());
    }

    #[test]
    fn tracker_flags_revisions() {
        let mut tracker = PartialTracker::new(0);
        let a = tracker.update("hello", 0.9, 100);
        assert!(!a.is_revision);
        let b = tracker.update("hello world", 0.9, 200);
        assert!(!b.is_revision);
        let c = tracker.update("yellow world", 0.9, 300);
        assert!(c.is_revision);
    }

    #[test]
    fn beam_search_collapses_blanks_and_repeats() {
        // vocab: 0 = blank, 1 = a, 2 = b. Sequence: a a blank b.
        let hi = 5.0;
        let lo = 0.0;
        let logits = vec![
            vec![lo, hi, lo],
            vec![lo, hi, lo],
            vec![hi, lo, lo],
            vec![lo, lo, hi],
        ];
        let (seq, conf) = ctc_beam_search(&logits, 4);
        assert_eq!(seq, vec![1, 2]);
        assert!(conf > 0.9);
    }

    #[test]
    fn beam_search_empty_input() {
        let (seq, conf) = ctc_beam_search(&[], 4);
        assert!(seq.is_empty());
        assert_eq!(conf, 0.0);
    }
}
