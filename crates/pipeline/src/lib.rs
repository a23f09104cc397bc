//! Streaming speech pipeline.
//!
//! Frames flow VAD → STT → turn detection; on end-of-turn the orchestrator
//! asks its [`TurnResponder`] for assistant tokens and streams them through
//! the TTS back to the transport, with barge-in cancelling both the audio
//! and the in-flight generation.

pub mod orchestrator;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

use thiserror::Error;

pub use orchestrator::{Orchestrator, PipelineEvent, TurnResponder};
pub use stt::{PartialTracker, StreamingStt};
pub use tts::{PcmChunk, StreamingTts, SynthEvent, SynthHandle};
pub use turn::{Completeness, TurnDetector};
pub use vad::VadEngine;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model error: {0}")]
    Model(String),
    #[error("vad error: {0}")]
    Vad(String),
    #[error("stt error: {0}")]
    Stt(String),
    #[error("tts error: {0}")]
    Tts(String),
    #[error("audio error: {0}")]
    Audio(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<PipelineError> for dhwani_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Model(m) => dhwani_core::Error::model_load(m),
            PipelineError::Vad(m) => dhwani_core::Error::inference("vad", m),
            PipelineError::Stt(m) => dhwani_core::Error::inference("stt", m),
            PipelineError::Tts(m) => dhwani_core::Error::inference("tts", m),
            PipelineError::Audio(m) => dhwani_core::Error::transport(m),
            PipelineError::Cancelled => dhwani_core::Error::Cancelled,
        }
    }
}
