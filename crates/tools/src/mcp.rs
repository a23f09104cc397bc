//! Tool protocol types: declarations, calls, results, and schema
//! validation. The JSON Schemas are compiled once when a tool is
//! registered and reused for every invocation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    /// Input failed schema validation; returned to the LLM so it can
    /// repair the call. The tool never executes.
    #[error("invalid arguments: {0}")]
    Validation(String),
    /// Output failed the declared output schema.
    #[error("malformed result: {0}")]
    MalformedResult(String),
    #[error("tool {tool} timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Declared tool metadata, loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub idempotent: bool,
    pub timeout_ms: u64,
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

/// The declared tool set for a domain.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCatalog {
    pub tools: Vec<ToolSpec>,
}

impl ToolCatalog {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, dhwani_core::Error> {
        let path = dir.as_ref().join("tools.yaml");
        let text = std::fs::read_to_string(&path).map_err(|e| {
            dhwani_core::Error::config_with(format!("cannot read {}", path.display()), e)
        })?;
        serde_yaml::from_str(&text).map_err(|e| {
            dhwani_core::Error::config_with(format!("cannot parse {}", path.display()), e)
        })
    }

    /// Shipped catalog, embedded for tests and defaults.
    pub fn builtin() -> Self {
        serde_yaml::from_str(include_str!("../../../config/domain/tools.yaml"))
            .expect("embedded tools.yaml")
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Rendered catalog for the prompt's tool section.
    pub fn render_for_prompt(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A model-issued invocation. Encoding to JSON and back yields an equal
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Value,
    pub call_id: String,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            call_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Json { json: Value },
    /// Base64 PCM payload
    Audio { data: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn json(json: Value) -> Self {
        ContentBlock::Json { json }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ContentBlock::Json { json } => Some(json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A tool implementation bound to a declared spec.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// Execute with already-validated arguments.
    async fn execute(&self, arguments: &Value) -> Result<Vec<ContentBlock>, ToolError>;
}

/// Render schema validation errors compactly for the model.
pub(crate) fn validation_errors(schema: &jsonschema::JSONSchema, instance: &Value) -> Option<String> {
    let result = schema.validate(instance);
    match result {
        Ok(()) => None,
        Err(errors) => {
            let rendered: Vec<String> = errors
                .take(4)
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            Some(rendered.join("; "))
        }
    }
}
