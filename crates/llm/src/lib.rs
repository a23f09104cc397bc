//! Language model backends and the speculative SLM/LLM executor.

pub mod backend;
pub mod prompt;
pub mod quality;
pub mod speculative;

use thiserror::Error;

pub use backend::{
    ContextHandle, FinishReason, GenerateRequest, Generation, LlmBackend, Message, OllamaBackend,
    Role,
};
pub use prompt::{PromptBuilder, PromptInputs};
pub use quality::QualityEstimator;
pub use speculative::{ModelUsed, SpeculativeExecutor, SpeculativeResult};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("generation error: {0}")]
    Generation(String),
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for dhwani_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => dhwani_core::Error::Cancelled,
            LlmError::Timeout => dhwani_core::Error::timeout("llm generation", 0),
            LlmError::Configuration(m) => dhwani_core::Error::config(m),
            other => dhwani_core::Error::inference("llm", other.to_string()),
        }
    }
}
