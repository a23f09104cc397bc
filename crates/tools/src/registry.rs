//! Tool registry: schema validation, bounded execution, call history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonschema::JSONSchema;
use parking_lot::Mutex;
use serde_json::Value;

use dhwani_config::ToolSettings;

use crate::mcp::{validation_errors, ContentBlock, Tool, ToolCall, ToolError, ToolResult, ToolSpec};

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    input_schema: JSONSchema,
    output_schema: Option<JSONSchema>,
    timeout: Duration,
}

/// One completed invocation, kept in the bounded history ring.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub call_id: String,
    pub duration_ms: u64,
    pub ok: bool,
    pub at: Instant,
}

pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Bounded ring; eviction pops from the front in O(1)
    history: Mutex<VecDeque<ToolCallRecord>>,
    history_len: usize,
}

impl ToolRegistry {
    pub fn new(settings: &ToolSettings) -> Self {
        Self {
            tools: HashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(settings.history_len)),
            history_len: settings.history_len,
        }
    }

    /// Register a tool, compiling its schemas once. Disabled tools are
    /// skipped; schema compilation failure is a configuration error.
    pub fn register(
        &mut self,
        tool: Arc<dyn Tool>,
        settings: &ToolSettings,
    ) -> Result<(), dhwani_core::Error> {
        let spec = tool.spec().clone();
        if !settings.is_enabled(&spec.name) {
            tracing::info!(tool = %spec.name, "tool disabled by configuration");
            return Ok(());
        }

        let input_schema = JSONSchema::compile(&spec.input_schema).map_err(|e| {
            dhwani_core::Error::config(format!("input schema for {}: {}", spec.name, e))
        })?;
        let output_schema = match &spec.output_schema {
            Some(schema) => Some(JSONSchema::compile(schema).map_err(|e| {
                dhwani_core::Error::config(format!("output schema for {}: {}", spec.name, e))
            })?),
            None => None,
        };

        // Priority: runtime override, then the declared per-tool timeout,
        // then the global default.
        let timeout_ms = settings
            .timeout_overrides_ms
            .get(&spec.name)
            .copied()
            .or((spec.timeout_ms > 0).then_some(spec.timeout_ms))
            .unwrap_or(settings.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);

        self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                tool,
                input_schema,
                output_schema,
                timeout,
            },
        );
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| t.tool.spec())
    }

    /// Invoke a tool call end to end: input validation, timed execution,
    /// output validation, history recording. Validation failures return
    /// before the tool runs.
    pub async fn invoke(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let registered = self
            .tools
            .get(&call.tool_name)
            .ok_or_else(|| ToolError::NotFound(call.tool_name.clone()))?;

        if let Some(errors) = validation_errors(&registered.input_schema, &call.arguments) {
            metrics::counter!("tool_validation_errors_total").increment(1);
            return Err(ToolError::Validation(errors));
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            registered.timeout,
            registered.tool.execute(&call.arguments),
        )
        .await;

        let content = match outcome {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                self.record(call, started, false);
                return Err(e);
            }
            Err(_) => {
                self.record(call, started, false);
                metrics::counter!("tool_timeouts_total").increment(1);
                return Err(ToolError::Timeout {
                    tool: call.tool_name.clone(),
                    timeout_ms: registered.timeout.as_millis() as u64,
                });
            }
        };

        // Every JSON block must satisfy the declared output schema.
        if let Some(ref output_schema) = registered.output_schema {
            for block in &content {
                if let Some(json) = block.as_json() {
                    if let Some(errors) = validation_errors(output_schema, json) {
                        self.record(call, started, false);
                        return Err(ToolError::MalformedResult(errors));
                    }
                }
            }
        }

        self.record(call, started, true);
        Ok(ToolResult {
            call_id: call.call_id.clone(),
            content,
            error: None,
        })
    }

    fn record(&self, call: &ToolCall, started: Instant, ok: bool) {
        let mut history = self.history.lock();
        if history.len() >= self.history_len {
            history.pop_front();
        }
        history.push_back(ToolCallRecord {
            tool_name: call.tool_name.clone(),
            call_id: call.call_id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            ok,
            at: started,
        });
    }

    pub fn recent_calls(&self, n: usize) -> Vec<ToolCallRecord> {
        let history = self.history.lock();
        history.iter().rev().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct SleepyTool {
        spec: ToolSpec,
        sleep_ms: u64,
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn execute(&self, _arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            Ok(vec![ContentBlock::json(json!({"branches": []}))])
        }
    }

    fn sleepy(name: &str, sleep_ms: u64) -> Arc<dyn Tool> {
        Arc::new(SleepyTool {
            spec: ToolSpec {
                name: name.to_string(),
                description: "test".to_string(),
                category: "info".to_string(),
                idempotent: true,
                timeout_ms: 2000,
                input_schema: json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"],
                }),
                output_schema: Some(json!({
                    "type": "object",
                    "properties": {"branches": {"type": "array"}},
                    "required": ["branches"],
                })),
            },
            sleep_ms,
        })
    }

    #[tokio::test]
    async fn validation_error_precedes_execution() {
        let settings = ToolSettings::default();
        let mut registry = ToolRegistry::new(&settings);
        registry.register(sleepy("locate", 0), &settings).unwrap();

        let call = ToolCall::new("locate", json!({"city": 42}));
        let err = registry.invoke(&call).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
        // Nothing was recorded: the tool never ran.
        assert!(registry.recent_calls(10).is_empty());
    }

    #[tokio::test]
    async fn stalled_tool_times_out() {
        let mut settings = ToolSettings::default();
        settings
            .timeout_overrides_ms
            .insert("locate".to_string(), 50);
        let mut registry = ToolRegistry::new(&settings);
        registry.register(sleepy("locate", 5_000), &settings).unwrap();

        let call = ToolCall::new("locate", json!({"city": "Mumbai"}));
        let err = registry.invoke(&call).await.unwrap_err();
        match err {
            ToolError::Timeout { tool, timeout_ms } => {
                assert_eq!(tool, "locate");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let settings = ToolSettings::default();
        let registry = ToolRegistry::new(&settings);
        let err = registry
            .invoke(&ToolCall::new("nope", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn disabled_tool_is_not_registered() {
        let mut settings = ToolSettings::default();
        settings.disabled.push("locate".to_string());
        let mut registry = ToolRegistry::new(&settings);
        registry.register(sleepy("locate", 0), &settings).unwrap();
        assert!(!registry.has("locate"));
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let mut settings = ToolSettings::default();
        settings.history_len = 3;
        let mut registry = ToolRegistry::new(&settings);
        registry.register(sleepy("locate", 0), &settings).unwrap();

        for _ in 0..5 {
            let call = ToolCall::new("locate", json!({"city": "Pune"}));
            registry.invoke(&call).await.unwrap();
        }
        assert_eq!(registry.recent_calls(10).len(), 3);
    }
}
