//! OpenAI-compatible LLM runner.
//!
//! Works with `OpenAI`, vLLM, LM Studio, Ollama, and any other endpoint
//! speaking the chat completions protocol. The message payload becomes
//! the user message; the assistant reply becomes the new payload.

use std::time::Duration;

use async_trait::async_trait;
use bridge_message::RunnerMessage;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::runner::Runner;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Extra wall-clock allowance on the HTTP client beyond the runner
/// timeout.
const HTTP_TIMEOUT_BUFFER: Duration = Duration::from_secs(2);

/// Configuration for [`LlmRunner`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LlmRunnerConfig {
    /// Chat completions endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// API key: a literal, `env:NAME`, or `file:/absolute/path`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// System prompt; the message payload is sent as the user message.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Completion token cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-message timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Retries on 429 and 5xx responses.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Base delay for the linear backoff, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Log prompts and replies. Off by default so payloads and secrets
    /// stay out of the logs.
    #[serde(default)]
    pub log_prompt: bool,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_max_tokens() -> usize {
    1024
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

/// Calls an OpenAI-compatible chat completions endpoint per message.
pub struct LlmRunner {
    client: Client,
    config: LlmRunnerConfig,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl LlmRunner {
    /// Resolve the secret and build the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] for unresolvable secrets (missing
    /// env variable, relative file path) and client build failures.
    pub fn new(config: LlmRunnerConfig) -> RunnerResult<Self> {
        let api_key = config.api_key.as_deref().map(resolve_secret).transpose()?;
        let timeout = Duration::from_millis(config.timeout);
        let client = Client::builder()
            .timeout(timeout + HTTP_TIMEOUT_BUFFER)
            .build()
            .map_err(|e| RunnerError::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            config,
            api_key,
            timeout,
        })
    }

    fn build_request(&self, user_content: &str) -> Value {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.config.prompt {
            messages.push(json!({ "role": "system", "content": prompt }));
        }
        messages.push(json!({ "role": "user", "content": user_content }));

        json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        })
    }

    async fn send_with_retry(&self, body: &Value) -> RunnerResult<ChatResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self.client.post(&self.config.base_url).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    return Err(RunnerError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                },
                Err(e) => return Err(RunnerError::Llm(e.to_string())),
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<ChatResponse>()
                    .await
                    .map_err(|e| RunnerError::Llm(format!("malformed response: {e}")));
            }

            let retriable =
                status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retriable || attempt > self.config.retries {
                let body = response.text().await.unwrap_or_default();
                return Err(RunnerError::Llm(format!(
                    "endpoint returned {status}: {body}"
                )));
            }

            let delay = Duration::from_millis(self.config.retry_delay * u64::from(attempt));
            warn!(%status, attempt, delay_ms = delay.as_millis() as u64, "retrying llm call");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Runner for LlmRunner {
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        let data = msg.data().await?;
        let user_content = String::from_utf8_lossy(&data).into_owned();

        if self.config.log_prompt {
            debug!(model = %self.config.model, prompt = %user_content, "sending prompt");
        }

        let body = self.build_request(&user_content);
        let response = self.send_with_retry(&body).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RunnerError::Llm("response carried no choices".to_string()))?;
        let content = choice.message.content.unwrap_or_default();

        if self.config.log_prompt {
            debug!(model = %self.config.model, reply = %content, "received reply");
        }

        msg.add_metadata("llm-model", self.config.model.clone())?;
        if let Some(reason) = choice.finish_reason {
            msg.add_metadata("llm-finish-reason", reason)?;
        }
        msg.set_data(Bytes::from(content.into_bytes()));
        Ok(())
    }

    async fn close(&self) -> RunnerResult<()> {
        Ok(())
    }
}

/// Resolve an API key reference: `env:NAME` reads the environment,
/// `file:/absolute/path` reads a file (relative paths are rejected),
/// anything else is the literal key.
fn resolve_secret(reference: &str) -> RunnerResult<String> {
    if let Some(name) = reference.strip_prefix("env:") {
        return std::env::var(name).map_err(|_| {
            RunnerError::Config(format!("environment variable {name:?} is not set"))
        });
    }
    if let Some(path) = reference.strip_prefix("file:") {
        if !std::path::Path::new(path).is_absolute() {
            return Err(RunnerError::Config(format!(
                "secret file path must be absolute, got {path:?}"
            )));
        }
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| RunnerError::Config(format!("secret file {path:?}: {e}")));
    }
    Ok(reference.to_string())
}
