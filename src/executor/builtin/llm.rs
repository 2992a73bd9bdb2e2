//! LLM inference executor for OpenAI-compatible chat completion APIs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ConfigError, ExecutorError};
use crate::executor::{ActionOutput, ExecutionContext, Executor, require_str};
use crate::task::Action;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for the inference endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL; `/chat/completions` is appended.
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl LlmConfig {
    /// Read `ORCH_LLM_BASE_URL`, `ORCH_LLM_API_KEY`, `ORCH_LLM_MODEL` and
    /// `ORCH_LLM_TIMEOUT_SECS`. Every variable is optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let request_timeout = match std::env::var("ORCH_LLM_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::InvalidValue {
                    key: "ORCH_LLM_TIMEOUT_SECS".to_string(),
                    message: format!("{raw:?}: {e}"),
                })?,
            Err(_) => defaults.request_timeout,
        };

        Ok(Self {
            base_url: std::env::var("ORCH_LLM_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("ORCH_LLM_API_KEY").ok().map(SecretString::from),
            model: std::env::var("ORCH_LLM_MODEL").unwrap_or(defaults.model),
            request_timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Executor for `llm_inference` actions.
///
/// Parameters: `prompt` (required), `system`, `model`, `max_tokens`,
/// `temperature`.
pub struct LlmExecutor {
    client: Client,
    config: LlmConfig,
}

impl LlmExecutor {
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Map an HTTP error status onto the retry classification.
fn classify_status(status: StatusCode, body: &str) -> ExecutorError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ExecutorError::Unavailable(detail)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExecutorError::NotAuthorized(detail)
    } else {
        ExecutorError::Rejected(detail)
    }
}

#[async_trait]
impl Executor for LlmExecutor {
    fn name(&self) -> &str {
        "llm_inference"
    }

    fn description(&self) -> &str {
        "Send a prompt to an OpenAI-compatible chat completion endpoint."
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ExecutorError> {
        let prompt = require_str(action, "prompt")?;
        let model = action.param_str("model").unwrap_or(&self.config.model);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = action.param_str("system") {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let body = ChatRequest {
            model,
            messages,
            max_tokens: action.param_u64("max_tokens"),
            temperature: action.parameters.get("temperature").and_then(|v| v.as_f64()),
        };

        let start = Instant::now();
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        // Don't let a single request outlive the task deadline.
        let timeout = ctx.bounded(self.config.request_timeout);
        request = request.timeout(timeout);

        tracing::debug!(model = model, task_id = %ctx.task_id, "Sending inference request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout(timeout)
            } else {
                ExecutorError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::ExecutionFailed(format!("malformed response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExecutorError::ExecutionFailed("response had no content".to_string()))?;

        Ok(ActionOutput::success(
            json!({
                "content": content,
                "model": parsed.model.unwrap_or_else(|| model.to_string()),
                "usage": parsed.usage,
            }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ExecutorError::NotAuthorized(_)
        ));
    }

    #[test]
    fn endpoint_joins_base_url() {
        let executor = LlmExecutor::new(LlmConfig::default().with_base_url("http://localhost:9/v1/"));
        assert_eq!(executor.endpoint(), "http://localhost:9/v1/chat/completions");
    }

    #[tokio::test]
    async fn missing_prompt_is_invalid() {
        let executor = LlmExecutor::new(LlmConfig::default());
        let err = executor
            .execute(
                &Action::new("ask", "llm_inference"),
                &ExecutionContext::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidParameters(_)));
    }
}
