//! The `LlmClient` boundary: an opaque text-completion facility. Out of scope as a full
//! integration — the core only assumes bounded latency, occasional transient failure,
//! and an honest text response.
//!
//! Grounded on the teacher's `async-trait`-based service boundaries (it has no LLM
//! client of its own, so the shape follows the pack's `pdftrans` client abstraction and
//! the teacher's own habit of wrapping external services behind a narrow trait).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::LlmError;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str, temperature: f32) -> Result<String, LlmError>;
}

/// Placeholder adapter for a real HTTP-based LLM backend. Left unimplemented because
/// no concrete vendor API is in scope; wiring a real provider means filling in `complete`
/// with an HTTP call configured from `LlmConfig`.
pub struct UnconfiguredLlmClient {
    #[allow(dead_code)]
    config: LlmConfig,
}

impl UnconfiguredLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        UnconfiguredLlmClient { config }
    }
}

#[async_trait]
impl LlmClient for UnconfiguredLlmClient {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str, _temperature: f32) -> Result<String, LlmError> {
        Err(LlmError::Request(
            "no LLM backend configured; supply an LlmClient implementation".to_string(),
        ))
    }
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionError {
    error: ChatCompletionErrorBody,
}

#[derive(Deserialize)]
struct ChatCompletionErrorBody {
    message: String,
}

/// `LlmClient` backed by an OpenAI-compatible chat completions endpoint. Any provider
/// that speaks the same wire format (the official API, a self-hosted gateway, a local
/// proxy) works by pointing `base_url` at it.
pub struct OpenAiCompatibleLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl OpenAiCompatibleLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        OpenAiCompatibleLlmClient {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: config.api_key.clone(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleLlmClient {
    #[tracing::instrument(name = "Calling LLM backend", skip(self, system_prompt, user_prompt))]
    async fn complete(&self, system_prompt: &str, user_prompt: &str, temperature: f32) -> Result<String, LlmError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).timeout(REQUEST_TIMEOUT).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ChatCompletionError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(LlmError::Request(format!("status {}: {}", status.as_u16(), detail)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Request(format!("malformed response body: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Request("response contained no choices".to_string()))
    }
}

/// Always-compiled test doubles (not `#[cfg(test)]`-gated) so integration tests under
/// `tests/` — a separate compilation unit from this crate — can use the same scripted
/// client as the unit tests below.
pub mod fixtures {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Test double that echoes canned responses by call order, optionally failing the
    /// first N calls so retry/backoff logic can be exercised deterministically.
    pub struct ScriptedLlmClient {
        responses: Mutex<Vec<ScriptedResponse>>,
        call_count: AtomicUsize,
    }

    pub enum ScriptedResponse {
        Ok(String),
        Err,
    }

    impl ScriptedLlmClient {
        pub fn new(responses: Vec<ScriptedResponse>) -> Self {
            ScriptedLlmClient {
                responses: Mutex::new(responses),
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn echo() -> Self {
            ScriptedLlmClient::new(vec![])
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlmClient {
        async fn complete(&self, _system_prompt: &str, user_prompt: &str, _temperature: f32) -> Result<String, LlmError> {
            self.call_count.fetch_add(1, Ordering::AcqRel);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(user_prompt.to_string());
            }
            match responses.remove(0) {
                ScriptedResponse::Ok(text) => Ok(text),
                ScriptedResponse::Err => Err(LlmError::Request("scripted failure".to_string())),
            }
        }
    }
}
