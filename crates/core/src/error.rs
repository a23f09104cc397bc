//! Error taxonomy shared across the workspace.
//!
//! Leaf errors from component crates are mapped into these kinds at crate
//! boundaries; the original cause is preserved through the `source` chain.
//! `Cancelled` is the expected outcome of barge-in and losing speculative
//! races and must never be logged at error level.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// Model weights unreadable or incompatible. Fatal at startup.
    #[error("model load error: {message}")]
    ModelLoad {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// Client disconnect or malformed frames. Session-local.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// Single-step inference failure; the step is skipped and counted.
    #[error("inference error in {component}: {message}")]
    Inference {
        component: &'static str,
        message: String,
    },

    /// A tool or LLM request exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Tool input failed schema validation; surfaced back to the LLM.
    #[error("validation error: {0}")]
    Validation(String),

    /// Expected cancellation (barge-in, losing race).
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with(message: impl Into<String>, source: impl Into<Source>) -> Self {
        Error::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn model_load(message: impl Into<String>) -> Self {
        Error::ModelLoad {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with(message: impl Into<String>, source: impl Into<Source>) -> Self {
        Error::Transport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn inference(component: &'static str, message: impl Into<String>) -> Self {
        Error::Inference {
            component,
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// True for errors that terminate the process at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::ModelLoad { .. })
    }

    /// Process exit code for startup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } => 1,
            Error::ModelLoad { .. } => 2,
            Error::Transport { .. } => 3,
            _ => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::config("x").exit_code(), 1);
        assert_eq!(Error::model_load("x").exit_code(), 2);
        assert_eq!(Error::transport("x").exit_code(), 3);
        assert_eq!(Error::Cancelled.exit_code(), 10);
    }

    #[test]
    fn source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
        let err = Error::config_with("cannot read settings", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
