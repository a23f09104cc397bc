//! Voice activity detection.
//!
//! A small classifier scores each 32 ms analysis window; scores are
//! exponentially smoothed and run through an enter/exit hysteresis with
//! hangover counters. All mutable state (rolling window, smoothed
//! probability, counters, mode) sits behind one non-awaiting mutex;
//! model inference runs outside that lock.

use parking_lot::Mutex;
use std::path::Path;

use dhwani_config::VadSettings;
use dhwani_core::{AudioFrame, VadEvent, FRAME_MS};

use crate::PipelineError;

#[cfg(feature = "onnx")]
use ort::session::{builder::GraphOptimizationLevel, Session};
#[cfg(feature = "onnx")]
use ort::value::Tensor;

/// Analysis window: 32 ms at 16 kHz.
const WINDOW_SAMPLES: usize = 512;
/// Exponential smoothing factor for the raw probability.
const SMOOTHING_ALPHA: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Silence,
    Speech,
}

struct VadState {
    window: Vec<f32>,
    smoothed: f32,
    enter_ms: u32,
    exit_ms: u32,
    mode: Mode,
}

/// Stateful VAD; one owner at a time.
pub struct VadEngine {
    #[cfg(feature = "onnx")]
    session: Mutex<Session>,
    settings: VadSettings,
    state: Mutex<VadState>,
}

impl VadEngine {
    #[cfg(feature = "onnx")]
    pub fn new(model_path: impl AsRef<Path>, settings: VadSettings) -> Result<Self, PipelineError> {
        let session = Session::builder()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        Ok(Self {
            session: Mutex::new(session),
            settings,
            state: Mutex::new(Self::fresh_state()),
        })
    }

    /// Model-free engine using energy-based scoring. Used in tests and when
    /// the `onnx` feature is off.
    #[cfg(not(feature = "onnx"))]
    pub fn new(_model_path: impl AsRef<Path>, settings: VadSettings) -> Result<Self, PipelineError> {
        Ok(Self::simple(settings))
    }

    #[cfg(not(feature = "onnx"))]
    pub fn simple(settings: VadSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(Self::fresh_state()),
        }
    }

    fn fresh_state() -> VadState {
        VadState {
            window: Vec::with_capacity(WINDOW_SAMPLES),
            smoothed: 0.0,
            enter_ms: 0,
            exit_ms: 0,
            mode: Mode::Silence,
        }
    }

    /// Feed one 10 ms frame; returns the transition event, if any.
    ///
    /// `SpeechOngoing` is reported on every speech frame so downstream
    /// consumers see activity at frame rate.
    pub fn push(&self, frame: &AudioFrame) -> Result<Option<VadEvent>, PipelineError> {
        // Energy floor fast path: obvious silence skips inference.
        let raw_prob = if frame.energy_db < self.settings.energy_floor_db {
            0.0
        } else {
            // Copy the window out under the lock, infer outside it.
            let window: Vec<f32> = {
                let mut state = self.state.lock();
                state.window.extend_from_slice(&frame.samples);
                let excess = state.window.len().saturating_sub(WINDOW_SAMPLES);
                if excess > 0 {
                    state.window.drain(..excess);
                }
                state.window.clone()
            };
            self.score_window(&window)?
        };

        let mut state = self.state.lock();
        state.smoothed = SMOOTHING_ALPHA * raw_prob + (1.0 - SMOOTHING_ALPHA) * state.smoothed;
        let smoothed = state.smoothed;
        let ts_us = frame.capture_ts_us;

        let event = match state.mode {
            Mode::Silence => {
                if smoothed > self.settings.enter_threshold {
                    state.enter_ms += FRAME_MS;
                    if state.enter_ms >= self.settings.enter_hangover_ms {
                        state.mode = Mode::Speech;
                        state.enter_ms = 0;
                        state.exit_ms = 0;
                        metrics::counter!("vad_speech_starts_total").increment(1);
                        Some(VadEvent::SpeechStart {
                            ts_us,
                            probability: smoothed,
                        })
                    } else {
                        None
                    }
                } else {
                    state.enter_ms = 0;
                    None
                }
            }
            Mode::Speech => {
                if smoothed < self.settings.exit_threshold {
                    state.exit_ms += FRAME_MS;
                    if state.exit_ms >= self.settings.exit_hangover_ms {
                        state.mode = Mode::Silence;
                        state.exit_ms = 0;
                        state.enter_ms = 0;
                        Some(VadEvent::SpeechEnd {
                            ts_us,
                            probability: smoothed,
                        })
                    } else {
                        // Still inside the hangover; speech is ongoing.
                        Some(VadEvent::SpeechOngoing {
                            ts_us,
                            probability: smoothed,
                        })
                    }
                } else {
                    state.exit_ms = 0;
                    Some(VadEvent::SpeechOngoing {
                        ts_us,
                        probability: smoothed,
                    })
                }
            }
        };

        Ok(event)
    }

    #[cfg(feature = "onnx")]
    fn score_window(&self, window: &[f32]) -> Result<f32, PipelineError> {
        if window.len() < WINDOW_SAMPLES {
            return Ok(0.0);
        }
        let input = ndarray::Array2::from_shape_vec((1, window.len()), window.to_vec())
            .map_err(|e| PipelineError::Vad(e.to_string()))?;
        let input_tensor =
            Tensor::from_array(input).map_err(|e| PipelineError::Model(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs!["input" => input_tensor])
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let (_, data) = outputs
            .get("output")
            .ok_or_else(|| PipelineError::Model("missing output tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(data.first().copied().unwrap_or(0.0))
    }

    /// Energy-derived probability used without a model: maps dB above the
    /// floor onto [0, 1].
    #[cfg(not(feature = "onnx"))]
    fn score_window(&self, window: &[f32]) -> Result<f32, PipelineError> {
        if window.is_empty() {
            return Ok(0.0);
        }
        let energy: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
        let energy_db = 10.0 * energy.max(1e-10).log10();
        let floor = self.settings.energy_floor_db;
        Ok(((energy_db - floor) / 40.0).clamp(0.0, 1.0))
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().mode == Mode::Speech
    }

    pub fn reset(&self) {
        *self.state.lock() = Self::fresh_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhwani_core::{SampleRate, FRAME_SAMPLES};

    fn loud_frame(seq: u64) -> AudioFrame {
        let samples: Vec<f32> = (0..FRAME_SAMPLES)
            .map(|i| (i as f32 * 0.3).sin() * 0.6)
            .collect();
        AudioFrame::new(samples, SampleRate::Hz16000, seq, seq * 10_000)
    }

    fn silent_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; FRAME_SAMPLES], SampleRate::Hz16000, seq, seq * 10_000)
    }

    fn engine() -> VadEngine {
        VadEngine::simple(VadSettings::default())
    }

    #[test]
    fn starts_and_ends_are_paired() {
        let vad = engine();
        let mut starts = 0;
        let mut ends = 0;
        let mut seq = 0;

        // Two utterances separated by long silence.
        for _ in 0..2 {
            for _ in 0..40 {
                match vad.push(&loud_frame(seq)).unwrap() {
                    Some(VadEvent::SpeechStart { .. }) => starts += 1,
                    Some(VadEvent::SpeechEnd { .. }) => ends += 1,
                    _ => {}
                }
                seq += 1;
            }
            for _ in 0..60 {
                match vad.push(&silent_frame(seq)).unwrap() {
                    Some(VadEvent::SpeechStart { .. }) => starts += 1,
                    Some(VadEvent::SpeechEnd { .. }) => ends += 1,
                    _ => {}
                }
                seq += 1;
            }
        }

        assert_eq!(starts, 2);
        assert_eq!(ends, 2);
    }

    #[test]
    fn zero_length_stream_emits_nothing() {
        let vad = engine();
        assert!(!vad.is_speaking());
    }

    #[test]
    fn single_quiet_frame_does_not_start_speech() {
        let vad = engine();
        let event = vad.push(&silent_frame(0)).unwrap();
        assert!(event.is_none());
        assert!(!vad.is_speaking());
    }

    #[test]
    fn enter_hangover_delays_start() {
        let vad = engine();
        // First loud frame alone must not trigger (hangover is 30 ms = 3 frames).
        assert!(vad.push(&loud_frame(0)).unwrap().is_none());
        let mut started = false;
        for seq in 1..10 {
            if matches!(
                vad.push(&loud_frame(seq)).unwrap(),
                Some(VadEvent::SpeechStart { .. })
            ) {
                started = true;
                break;
            }
        }
        assert!(started);
    }

    #[test]
    fn brief_dip_does_not_end_speech() {
        let vad = engine();
        let mut seq = 0;
        for _ in 0..20 {
            vad.push(&loud_frame(seq)).unwrap();
            seq += 1;
        }
        assert!(vad.is_speaking());
        // 100 ms of silence is below the 200 ms exit hangover.
        for _ in 0..10 {
            let event = vad.push(&silent_frame(seq)).unwrap();
            assert!(!matches!(event, Some(VadEvent::SpeechEnd { .. })));
            seq += 1;
        }
        assert!(vad.is_speaking());
    }
}
