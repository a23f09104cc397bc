//! Runtime settings.
//!
//! Load order: `config/default.yaml` < `config/{env}.yaml` < `DHWANI_*`
//! environment variables (double underscore as separator, e.g.
//! `DHWANI_VAD__ENTER_THRESHOLD=0.7`). `MODELS_PATH`, `QDRANT_URL` and
//! `OLLAMA_URL` are honored directly for the paths they name.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use dhwani_core::{Error, Language, Result};

/// Speculative execution strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LlmStrategy {
    /// Small model first, large model on low quality (default)
    #[default]
    SlmFirst,
    /// Run both in parallel, first acceptable answer wins
    Race,
    /// Stream the small model, switch cleanly on quality drop
    Hybrid,
    /// SLM drafts, LLM judges and may overwrite. Adds a full LLM pass on
    /// top of the draft, so it RAISES latency; kept selectable for quality
    /// experiments only.
    DraftVerify,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub language: LanguageSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub vad: VadSettings,
    #[serde(default)]
    pub stt: SttSettings,
    #[serde(default)]
    pub turn: TurnSettings,
    #[serde(default)]
    pub tts: TtsSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub models: ModelPaths,
    /// Directory holding the domain data files
    #[serde(default = "default_domain_dir")]
    pub domain_dir: String,
}

fn default_domain_dir() -> String {
    "config/domain".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSettings {
    /// Default response language
    #[serde(default)]
    pub primary: Language,
}

impl Default for LanguageSettings {
    fn default() -> Self {
        Self {
            primary: Language::Hindi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Token-bucket capacity for inbound connections
    #[serde(default = "default_rate_burst")]
    pub rate_limit_burst: u32,
    /// Token refill rate per second
    #[serde(default = "default_rate_per_sec")]
    pub rate_limit_per_sec: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_rate_burst() -> u32 {
    20
}
fn default_rate_per_sec() -> f64 {
    10.0
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            rate_limit_burst: default_rate_burst(),
            rate_limit_per_sec: default_rate_per_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    #[serde(default = "default_enter_threshold")]
    pub enter_threshold: f32,
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: f32,
    #[serde(default = "default_enter_hangover_ms")]
    pub enter_hangover_ms: u32,
    #[serde(default = "default_exit_hangover_ms")]
    pub exit_hangover_ms: u32,
    /// Frames below this dB floor skip model inference entirely
    #[serde(default = "default_energy_floor_db")]
    pub energy_floor_db: f32,
}

fn default_enter_threshold() -> f32 {
    0.6
}
fn default_exit_threshold() -> f32 {
    0.35
}
fn default_enter_hangover_ms() -> u32 {
    30
}
fn default_exit_hangover_ms() -> u32 {
    200
}
fn default_energy_floor_db() -> f32 {
    -55.0
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            enter_threshold: default_enter_threshold(),
            exit_threshold: default_exit_threshold(),
            enter_hangover_ms: default_enter_hangover_ms(),
            exit_hangover_ms: default_exit_hangover_ms(),
            energy_floor_db: default_energy_floor_db(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    /// Decode step interval in milliseconds
    #[serde(default = "default_decode_interval_ms")]
    pub decode_interval_ms: u32,
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    /// Finals below this mean confidence are replaced by an empty,
    /// low-confidence-flagged transcript
    #[serde(default = "default_min_final_confidence")]
    pub min_final_confidence: f32,
}

fn default_decode_interval_ms() -> u32 {
    200
}
fn default_beam_width() -> usize {
    4
}
fn default_min_final_confidence() -> f32 {
    0.35
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            decode_interval_ms: default_decode_interval_ms(),
            beam_width: default_beam_width(),
            min_final_confidence: default_min_final_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSettings {
    /// Silence alone declares end-of-turn after this long
    #[serde(default = "default_vad_eot_ms")]
    pub vad_eot_ms: u32,
    /// Semantic completeness confidence required for the fast path
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    #[serde(default = "default_true")]
    pub semantic_enabled: bool,
    /// Minimum silence even when semantics say the utterance is complete
    #[serde(default = "default_semantic_min_silence_ms")]
    pub semantic_min_silence_ms: u32,
}

fn default_vad_eot_ms() -> u32 {
    700
}
fn default_semantic_threshold() -> f32 {
    0.75
}
fn default_semantic_min_silence_ms() -> u32 {
    200
}
fn default_true() -> bool {
    true
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            vad_eot_ms: default_vad_eot_ms(),
            semantic_threshold: default_semantic_threshold(),
            semantic_enabled: true,
            semantic_min_silence_ms: default_semantic_min_silence_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Outbound chunk size in milliseconds (20-40)
    #[serde(default = "default_tts_chunk_ms")]
    pub chunk_ms: u32,
    #[serde(default = "default_speaking_rate")]
    pub speaking_rate: f32,
}

fn default_voice() -> String {
    "priya".to_string()
}
fn default_tts_chunk_ms() -> u32 {
    20
}
fn default_speaking_rate() -> f32 {
    1.0
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            chunk_ms: default_tts_chunk_ms(),
            speaking_rate: default_speaking_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub strategy: LlmStrategy,
    #[serde(default = "default_slm_timeout_ms")]
    pub slm_timeout_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ollama_url")]
    pub endpoint: String,
    #[serde(default = "default_slm_model")]
    pub slm_model: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Quality floor below which the SLM answer is discarded
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
    /// Stop phrases that mark an answer unusable
    #[serde(default = "default_stop_phrases")]
    pub stop_phrases: Vec<String>,
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,
}

fn default_slm_timeout_ms() -> u64 {
    200
}
fn default_keep_alive_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_ollama_url() -> String {
    std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}
fn default_slm_model() -> String {
    "qwen2.5:1.5b-instruct".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}
fn default_max_tokens() -> usize {
    256
}
fn default_temperature() -> f32 {
    0.7
}
fn default_quality_threshold() -> f32 {
    0.6
}
fn default_stop_phrases() -> Vec<String> {
    vec![
        "i don't know".to_string(),
        "i cannot help".to_string(),
        "मुझे नहीं पता".to_string(),
    ]
}
fn default_context_budget() -> usize {
    3072
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            strategy: LlmStrategy::SlmFirst,
            slm_timeout_ms: default_slm_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            max_retries: default_max_retries(),
            endpoint: default_ollama_url(),
            slm_model: default_slm_model(),
            llm_model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            quality_threshold: default_quality_threshold(),
            stop_phrases: default_stop_phrases(),
            context_budget_tokens: default_context_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Fused candidate count after RRF
    #[serde(default = "default_top_k1")]
    pub top_k1: usize,
    /// Candidates surviving the lexical pre-filter into the cross-encoder
    #[serde(default = "default_top_k2")]
    pub top_k2: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    /// Partial-transcript token count that triggers prefetch
    #[serde(default = "default_prefetch_min_tokens")]
    pub prefetch_min_tokens: usize,
    /// Max embedding cosine distance for prefetch reuse
    #[serde(default = "default_prefetch_max_distance")]
    pub prefetch_max_distance: f32,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_top_k1() -> usize {
    50
}
fn default_top_k2() -> usize {
    10
}
fn default_rrf_k() -> f32 {
    60.0
}
fn default_prefetch_min_tokens() -> usize {
    3
}
fn default_prefetch_max_distance() -> f32 {
    0.1
}
fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6334".to_string())
}
fn default_collection() -> String {
    "gold_loan_knowledge".to_string()
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k1: default_top_k1(),
            top_k2: default_top_k2(),
            rrf_k: default_rrf_k(),
            prefetch_min_tokens: default_prefetch_min_tokens(),
            prefetch_max_distance: default_prefetch_max_distance(),
            qdrant_url: default_qdrant_url(),
            collection: default_collection(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Default execution deadline
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Per-tool timeout overrides, keyed by tool name
    #[serde(default)]
    pub timeout_overrides_ms: std::collections::HashMap<String, u64>,
    /// Tools disabled by configuration
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_history_len() -> usize {
    64
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tool_timeout_ms(),
            timeout_overrides_ms: Default::default(),
            disabled: Vec::new(),
            history_len: default_history_len(),
        }
    }
}

impl ToolSettings {
    pub fn timeout_ms_for(&self, tool: &str) -> u64 {
        self.timeout_overrides_ms
            .get(tool)
            .copied()
            .unwrap_or(self.default_timeout_ms)
    }

    pub fn is_enabled(&self, tool: &str) -> bool {
        !self.disabled.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Working-memory turn window before summarization triggers
    #[serde(default = "default_working_turns")]
    pub working_memory_turns: usize,
}

fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_turns() -> usize {
    200
}
fn default_working_turns() -> usize {
    8
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_turns: default_max_turns(),
            working_memory_turns: default_working_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPaths {
    /// Directory holding VAD/STT/TTS/reranker weights
    #[serde(default = "default_models_path")]
    pub dir: String,
    #[serde(default = "default_vad_model")]
    pub vad: String,
    #[serde(default = "default_stt_model")]
    pub stt: String,
    #[serde(default = "default_tts_model")]
    pub tts: String,
    #[serde(default = "default_reranker_model")]
    pub reranker: String,
}

fn default_models_path() -> String {
    std::env::var("MODELS_PATH").unwrap_or_else(|_| "models".to_string())
}
fn default_vad_model() -> String {
    "vad.onnx".to_string()
}
fn default_stt_model() -> String {
    "stt_conformer.onnx".to_string()
}
fn default_tts_model() -> String {
    "tts_vits.onnx".to_string()
}
fn default_reranker_model() -> String {
    "reranker_minilm.onnx".to_string()
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            dir: default_models_path(),
            vad: default_vad_model(),
            stt: default_stt_model(),
            tts: default_tts_model(),
            reranker: default_reranker_model(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.vad.enter_threshold <= self.vad.exit_threshold {
            return Err(Error::config(
                "vad.enter_threshold must exceed vad.exit_threshold",
            ));
        }
        if self.vad.enter_hangover_ms < 30 {
            return Err(Error::config("vad.enter_hangover_ms must be >= 30"));
        }
        if self.vad.exit_hangover_ms < 200 {
            return Err(Error::config("vad.exit_hangover_ms must be >= 200"));
        }
        if !(0.0..=1.0).contains(&self.turn.semantic_threshold) {
            return Err(Error::config("turn.semantic_threshold must be in [0, 1]"));
        }
        if self.retrieval.top_k2 > self.retrieval.top_k1 {
            return Err(Error::config("retrieval.top_k2 must not exceed top_k1"));
        }
        if !(20..=40).contains(&self.tts.chunk_ms) {
            return Err(Error::config("tts.chunk_ms must be within 20..=40"));
        }
        Ok(())
    }
}

/// Load layered settings. `env` selects an overlay file such as
/// `config/production.yaml`.
pub fn load_settings(env: Option<&str>) -> Result<Settings> {
    let mut builder = Config::builder().add_source(File::from(Path::new("config/default.yaml")).required(false));

    if let Some(env) = env {
        builder = builder
            .add_source(File::from(Path::new(&format!("config/{env}.yaml"))).required(false));
    }

    let config = builder
        .add_source(Environment::with_prefix("DHWANI").separator("__"))
        .build()
        .map_err(|e| Error::config_with("failed to assemble configuration", e))?;

    let settings: Settings = config
        .try_deserialize()
        .map_err(|e| Error::config_with("failed to deserialize configuration", e))?;

    settings.validate()?;
    Ok(settings)
}
