//! Streaming text-to-speech.
//!
//! Text is chunked on prosodic boundaries down to words; each word is
//! synthesized and emitted as 20–40 ms PCM chunks over an mpsc channel.
//! Cancellation is word-granular: the in-flight word finishes, the stream
//! closes with `Cancelled`, and every chunk already emitted is valid audio.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use dhwani_config::TtsSettings;
use dhwani_core::{Language, SampleRate};

use crate::PipelineError;

/// A slice of synthesized audio, 20–40 ms at 16 kHz.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Arc<[f32]>,
    pub sample_rate: SampleRate,
    /// Index of the word this chunk belongs to
    pub word_index: usize,
}

/// Stream items produced by a synthesis run.
///
/// `Cancelled` is an expected outcome, not an error; it is never logged at
/// error level.
#[derive(Debug, Clone)]
pub enum SynthEvent {
    Chunk(PcmChunk),
    Completed { words: usize },
    Cancelled { after_word: usize },
}

/// Word-level synthesis backend. Process-wide, shared across sessions.
pub trait TtsSynth: Send + Sync {
    fn synthesize_word(
        &self,
        word: &str,
        voice: &str,
        language: Language,
    ) -> Result<Vec<f32>, PipelineError>;

    fn sample_rate(&self) -> SampleRate {
        SampleRate::Hz16000
    }
}

/// Caller-side control for one synthesis run.
#[derive(Clone)]
pub struct SynthHandle {
    cancel: Arc<AtomicBool>,
    current_word: Arc<AtomicUsize>,
}

impl SynthHandle {
    /// Finish the in-flight word, then stop. Idempotent.
    pub fn cancel_after_current_word(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Words fully emitted so far.
    pub fn words_spoken(&self) -> usize {
        self.current_word.load(Ordering::Acquire)
    }
}

/// Streaming synthesizer front-end.
pub struct StreamingTts {
    backend: Arc<dyn TtsSynth>,
    settings: TtsSettings,
}

impl StreamingTts {
    pub fn new(backend: Arc<dyn TtsSynth>, settings: TtsSettings) -> Self {
        Self { backend, settings }
    }

    /// Begin synthesis; chunks arrive on the returned receiver. The first
    /// chunk is produced as soon as the first word is synthesized.
    pub fn synthesize(
        &self,
        text: &str,
        language: Language,
    ) -> (mpsc::Receiver<SynthEvent>, SynthHandle) {
        let (tx, rx) = mpsc::channel(64);
        let handle = SynthHandle {
            cancel: Arc::new(AtomicBool::new(false)),
            current_word: Arc::new(AtomicUsize::new(0)),
        };

        let words = prosodic_words(text);
        let backend = self.backend.clone();
        let voice = self.settings.voice.clone();
        let chunk_ms = self.settings.chunk_ms;
        let task_handle = handle.clone();

        tokio::spawn(async move {
            let total = words.len();
            for (index, word) in words.into_iter().enumerate() {
                if task_handle.cancel.load(Ordering::Acquire) {
                    let _ = tx
                        .send(SynthEvent::Cancelled {
                            after_word: task_handle.current_word.load(Ordering::Acquire),
                        })
                        .await;
                    return;
                }

                // Model inference is synchronous; run it on the blocking pool.
                let synth_backend = backend.clone();
                let synth_voice = voice.clone();
                let synth_word = word.clone();
                let synth = tokio::task::spawn_blocking(move || {
                    synth_backend.synthesize_word(&synth_word, &synth_voice, language)
                })
                .await;

                let samples = match synth {
                    Ok(Ok(samples)) => samples,
                    Ok(Err(e)) => {
                        tracing::warn!(word = %word, "tts word synthesis failed, skipped: {}", e);
                        metrics::counter!("tts_word_failures_total").increment(1);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("tts blocking task failed: {}", e);
                        continue;
                    }
                };

                let rate = backend_rate(&*backend);
                let chunk_samples = (rate.as_u32() as usize * chunk_ms as usize) / 1000;
                for chunk in samples.chunks(chunk_samples.max(1)) {
                    let event = SynthEvent::Chunk(PcmChunk {
                        samples: chunk.to_vec().into(),
                        sample_rate: rate,
                        word_index: index,
                    });
                    if tx.send(event).await.is_err() {
                        // Receiver dropped; treat as cancellation.
                        return;
                    }
                }
                task_handle.current_word.store(index + 1, Ordering::Release);
            }
            let _ = tx.send(SynthEvent::Completed { words: total }).await;
        });

        (rx, handle)
    }
}

fn backend_rate(backend: &dyn TtsSynth) -> SampleRate {
    backend.sample_rate()
}

/// Split text into word units, keeping trailing punctuation attached so the
/// synthesizer can realize phrase-final prosody.
fn prosodic_words(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Deterministic model-free synthesizer: a shaped tone whose duration
/// scales with the word's grapheme count. Stands in for the ONNX voice in
/// tests and model-free deployments.
pub struct ToneSynth;

impl TtsSynth for ToneSynth {
    fn synthesize_word(
        &self,
        word: &str,
        _voice: &str,
        _language: Language,
    ) -> Result<Vec<f32>, PipelineError> {
        let graphemes = dhwani_core::language::grapheme_count(word).max(1);
        let duration_ms = 60 * graphemes.min(10) + 60;
        let n = (16_000 * duration_ms) / 1000;
        let mut samples = Vec::with_capacity(n);
        for i in 0..n {
            let t = i as f32 / 16_000.0;
            // Short fade at both ends so concatenation stays click-free.
            let edge = (n - i).min(i).min(160) as f32 / 160.0;
            samples.push((t * 2.0 * std::f32::consts::PI * 220.0).sin() * 0.2 * edge);
        }
        Ok(samples)
    }
}

/// ONNX VITS-style synthesizer.
#[cfg(feature = "onnx")]
pub struct OnnxSynth {
    session: parking_lot::Mutex<ort::session::Session>,
    speaking_rate: f32,
}

#[cfg(feature = "onnx")]
impl OnnxSynth {
    pub fn new(
        model_path: impl AsRef<std::path::Path>,
        speaking_rate: f32,
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
        Ok(Self {
            session: parking_lot::Mutex::new(session),
            speaking_rate,
        })
    }
}

#[cfg(feature = "onnx")]
impl TtsSynth for OnnxSynth {
    fn synthesize_word(
        &self,
        word: &str,
        _voice: &str,
        _language: Language,
    ) -> Result<Vec<f32>, PipelineError> {
        use ort::value::Tensor;

        let ids: Vec<i64> = word.chars().map(|c| c as i64).collect();
        let input = ndarray::Array2::from_shape_vec((1, ids.len()), ids)
            .map_err(|e| PipelineError::Tts(e.to_string()))?;
        let lengths = ndarray::Array2::from_shape_vec((1, 1), vec![word.chars().count() as i64])
            .map_err(|e| PipelineError::Tts(e.to_string()))?;
        let scales = ndarray::Array2::from_shape_vec((1, 3), vec![0.667, self.speaking_rate, 0.8])
            .map_err(|e| PipelineError::Tts(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input" => Tensor::from_array(input).map_err(|e| PipelineError::Model(e.to_string()))?,
                "input_lengths" => Tensor::from_array(lengths).map_err(|e| PipelineError::Model(e.to_string()))?,
                "scales" => Tensor::from_array(scales).map_err(|e| PipelineError::Model(e.to_string()))?,
            ])
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let (_, data) = outputs
            .get("output")
            .ok_or_else(|| PipelineError::Model("missing output tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tts() -> StreamingTts {
        StreamingTts::new(Arc::new(ToneSynth), TtsSettings::default())
    }

    #[tokio::test]
    async fn chunks_are_bounded_and_complete() {
        let tts = tts();
        let (mut rx, _handle) = tts.synthesize("नमस्ते gold loan", Language::Hinglish);

        let mut chunks = 0;
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                SynthEvent::Chunk(chunk) => {
                    chunks += 1;
                    // 20 ms at 16 kHz = 320 samples; last chunk may be short.
                    assert!(chunk.samples.len() <= 320);
                }
                SynthEvent::Completed { words } => {
                    completed = true;
                    assert_eq!(words, 3);
                }
                SynthEvent::Cancelled { .. } => panic!("unexpected cancel"),
            }
        }
        assert!(completed);
        assert!(chunks > 3);
    }

    #[tokio::test]
    async fn cancel_finishes_current_word_only() {
        let tts = tts();
        let (mut rx, handle) =
            tts.synthesize("one two three four five six seven eight", Language::English);

        // Let the first word through, then cancel.
        let first = rx.recv().await.unwrap();
        let first_word = match first {
            SynthEvent::Chunk(c) => c.word_index,
            other => panic!("expected chunk, got {:?}", other),
        };
        handle.cancel_after_current_word();

        let mut max_word = first_word;
        let mut cancelled_at = None;
        while let Some(event) = rx.recv().await {
            match event {
                SynthEvent::Chunk(c) => max_word = max_word.max(c.word_index),
                SynthEvent::Cancelled { after_word } => {
                    cancelled_at = Some(after_word);
                }
                SynthEvent::Completed { .. } => panic!("should not complete after cancel"),
            }
        }

        let after = cancelled_at.expect("cancel event");
        // The in-flight word may finish; nothing beyond it is spoken.
        assert!(max_word <= after);
        assert!(after < 8);
    }

    #[tokio::test]
    async fn empty_text_completes_immediately() {
        let tts = tts();
        let (mut rx, _handle) = tts.synthesize("", Language::English);
        match rx.recv().await.unwrap() {
            SynthEvent::Completed { words } => assert_eq!(words, 0),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn tone_synth_fades_edges() {
        let samples = ToneSynth
            .synthesize_word("नमस्ते", "priya", Language::Hindi)
            .unwrap();
        assert!(samples.len() > 1600);
        assert!(samples[0].abs() < 1e-3);
        assert!(samples[samples.len() - 1].abs() < 1e-3);
    }
}
