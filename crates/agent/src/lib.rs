//! Conversation agent: stage FSM, intent classification, slot filling,
//! hierarchical memory, and the turn-handling policy that binds the
//! speculative LLM executor and the tool registry to the speech pipeline.

pub mod agent;
pub mod intent;
pub mod memory;
pub mod slots;
pub mod stage;

pub use agent::VoiceAgent;
pub use intent::{Intent, IntentClassifier};
pub use memory::{HierarchicalMemory, LlmSummarizer, MemoryConfig, Summarizer};
pub use slots::{SlotExtractor, SlotStore, SlotValue};
pub use stage::{Stage, StageMachine};
