//! LLM backend contract and the Ollama implementation.
//!
//! Ollama supports KV-cache session continuation: each completion returns
//! an opaque context handle which, re-supplied on the next call of the same
//! session, skips re-processing the conversation prefix. `keep_alive`
//! keeps weights resident between turns. Transport failures retry with
//! exponential backoff, at most `max_retries` times.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dhwani_config::LlmSettings;

use crate::LlmError;

/// Opaque KV-cache continuation handle; one active handle per session.
pub type ContextHandle = Vec<i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: Role::Tool, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub max_tokens: usize,
    pub temperature: f32,
    /// KV-cache continuation from the previous completion of this session
    pub context: Option<ContextHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tokens: usize,
    pub time_to_first_token_ms: u64,
    pub total_time_ms: u64,
    pub finish_reason: FinishReason,
    /// Handle for KV-cache reuse on the session's next call
    pub context: Option<ContextHandle>,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a complete response.
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, LlmError>;

    /// Generate while streaming tokens into `tx`. A dropped receiver or a
    /// fired `cancel` token stops generation with `FinishReason::Cancelled`.
    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<Generation, LlmError>;

    async fn is_available(&self) -> bool;

    fn model_name(&self) -> &str;

    /// Language-aware token estimate; see `dhwani_core::language`.
    fn estimate_tokens(&self, text: &str) -> usize {
        dhwani_core::language::estimate_tokens(text)
    }
}

/// Ollama chat backend.
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
    keep_alive: String,
    max_retries: u32,
    initial_backoff: Duration,
}

impl OllamaBackend {
    pub fn new(settings: &LlmSettings, model: impl Into<String>) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            model: model.into(),
            keep_alive: format!("{}s", settings.keep_alive_secs),
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(100),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.endpoint, path)
    }

    fn build_request(&self, request: &GenerateRequest, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                    }
                    .to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens as i32,
            },
            keep_alive: self.keep_alive.clone(),
            context: request.context.clone(),
        }
    }

    fn is_retryable(error: &LlmError) -> bool {
        matches!(error, LlmError::Network(_) | LlmError::Timeout)
    }

    async fn execute_once(&self, body: &OllamaChatRequest) -> Result<OllamaChatResponse, LlmError> {
        let response = self.client.post(self.api_url("/chat")).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(LlmError::Network(format!("server error {}: {}", status, text)));
            }
            return Err(LlmError::Api(text));
        }
        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, LlmError> {
        let started = Instant::now();
        let body = self.build_request(request, false);

        let mut backoff = self.initial_backoff;
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "llm request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.execute_once(&body).await {
                Ok(result) => {
                    return Ok(Generation {
                        text: result.message.content,
                        tokens: result.eval_count.unwrap_or(0) as usize,
                        time_to_first_token_ms: result.prompt_eval_duration.unwrap_or(0)
                            / 1_000_000,
                        total_time_ms: started.elapsed().as_millis() as u64,
                        finish_reason: if result.done {
                            FinishReason::Stop
                        } else {
                            FinishReason::Length
                        },
                        context: result.context,
                    });
                }
                Err(e) if Self::is_retryable(&e) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(LlmError::Timeout))
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<Generation, LlmError> {
        use futures::StreamExt;

        let started = Instant::now();
        let body = self.build_request(request, true);

        let response = self.client.post(self.api_url("/chat")).json(&body).send().await?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(text));
        }

        let mut stream = response.bytes_stream();
        let mut text = String::new();
        let mut tokens = 0usize;
        let mut first_token = None;
        let mut context = None;
        let mut cancelled = false;

        'outer: loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break 'outer;
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            for line in String::from_utf8_lossy(&chunk).lines() {
                if line.is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<OllamaStreamChunk>(line) else {
                    continue;
                };
                if first_token.is_none() {
                    first_token = Some(started.elapsed());
                }
                text.push_str(&parsed.message.content);
                tokens += 1;
                if parsed.done {
                    context = parsed.context;
                }
                if tx.send(parsed.message.content).await.is_err() {
                    // Receiver gone: treat as cancellation.
                    cancelled = true;
                    break 'outer;
                }
                if parsed.done {
                    break 'outer;
                }
            }
        }

        let finish_reason = if cancelled {
            FinishReason::Cancelled
        } else {
            FinishReason::Stop
        };

        Ok(Generation {
            text,
            tokens,
            time_to_first_token_ms: first_token.map(|t| t.as_millis() as u64).unwrap_or(0),
            total_time_ms: started.elapsed().as_millis() as u64,
            finish_reason,
            context,
        })
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.endpoint))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    keep_alive: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Vec<i64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    done: bool,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    context: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: OllamaMessage,
    done: bool,
    #[serde(default)]
    context: Option<Vec<i64>>,
}
