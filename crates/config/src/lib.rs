//! Configuration for the dhwani voice agent.
//!
//! Two layers: [`Settings`] holds runtime tuning (thresholds, timeouts,
//! endpoints) loaded from `config/*.yaml` plus `DHWANI_` environment
//! overrides; [`DomainConfig`] holds the sales-domain data (branches,
//! competitor rates, intents, slots, stages, pricing) loaded from
//! `config/domain/*.yaml`. Both are immutable snapshots after startup;
//! hot reload is an explicit swap of a whole new snapshot.

pub mod domain;
pub mod settings;

pub use domain::{
    BranchRecord, CompetitorRate, DomainConfig, FallbackUtterances, IntentDef, PersonaPrompts,
    PricingConfig, PurityTier, SlotDef, SlotKind, StageDef,
};
pub use settings::{
    load_settings, LlmSettings, LlmStrategy, ModelPaths, RetrievalSettings, ServerSettings,
    SessionSettings, Settings, SttSettings, ToolSettings, TtsSettings, TurnSettings, VadSettings,
};
