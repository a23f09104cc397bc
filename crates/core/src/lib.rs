//! Core types shared across the dhwani voice agent crates:
//! audio frames and channel plumbing, conversation turns, transcripts,
//! language handling, and the error taxonomy.

pub mod audio;
pub mod conversation;
pub mod error;
pub mod language;
pub mod transcript;

pub use audio::{
    frame_channel, spsc_ring, AudioFrame, FrameReceiver, FrameSender, RingConsumer, RingProducer,
    SampleRate, FRAME_MS, FRAME_SAMPLES,
};
pub use conversation::{ConversationTurn, TurnRole};
pub use error::{Error, Result};
pub use language::Language;
pub use transcript::{Transcript, TurnEvent, VadEvent};
