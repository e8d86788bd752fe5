//! Provider-facing completion client.
//!
//! Every provider except Anthropic speaks the OpenAI chat-completions
//! shape, so request building is one function with small per-provider
//! tweaks. The rest of the crate only sees the [`Completion`] trait.

pub mod retry;

use std::future::Future;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub use retry::RetryHint;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_MAX_TOKENS: u32 = 8192;

/// A single system+user completion call. The queue and the pipeline are
/// generic over this seam; tests substitute scripted implementations.
pub trait Completion: Send + Sync + 'static {
    fn complete(
        &self,
        system: &str,
        user: &str,
    ) -> impl Future<Output = Result<String, CompletionError>> + Send;
}

#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("missing API key for {0}")]
    MissingApiKey(ProviderId),
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_hint: Option<RetryHint>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl CompletionError {
    /// Server-supplied retry delay, when the failure carried one.
    pub fn retry_hint(&self) -> Option<&RetryHint> {
        match self {
            CompletionError::Http { retry_hint, .. } => retry_hint.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    DeepSeek,
    XAi,
    Google,
    OpenRouter,
}

impl ProviderId {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OpenAI",
            ProviderId::Anthropic => "Anthropic",
            ProviderId::DeepSeek => "DeepSeek",
            ProviderId::XAi => "xAI",
            ProviderId::Google => "Google",
            ProviderId::OpenRouter => "OpenRouter",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "https://api.openai.com/v1/chat/completions",
            ProviderId::Anthropic => "https://api.anthropic.com/v1/messages",
            ProviderId::DeepSeek => "https://api.deepseek.com/v1/chat/completions",
            ProviderId::XAi => "https://api.x.ai/v1/chat/completions",
            ProviderId::Google => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            }
            ProviderId::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// HTTP-backed [`Completion`] implementation.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: ProviderId,
    model: String,
    api_key: String,
    endpoint: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(provider: ProviderId, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: api_key.into(),
            endpoint: provider.default_endpoint().to_string(),
            max_tokens: match provider {
                ProviderId::Anthropic => ANTHROPIC_MAX_TOKENS,
                _ => DEFAULT_MAX_TOKENS,
            },
            http: reqwest::Client::new(),
        }
    }

    /// Overrides the provider's default endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    fn build_payload(&self, system: &str, user: &str) -> Value {
        match self.provider {
            ProviderId::Anthropic => json!({
                "model": self.model,
                "system": system,
                "messages": [{ "role": "user", "content": user }],
                "max_tokens": self.max_tokens,
                "temperature": 0.5,
            }),
            ProviderId::XAi => json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
                "max_completion_tokens": self.max_tokens,
                "temperature": 0.6,
                "top_p": 0.95,
            }),
            _ => json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
                "max_tokens": self.max_tokens,
                "temperature": 0.6,
                "top_p": 0.95,
            }),
        }
    }

    fn parse_body(&self, body: &Value) -> Result<String, CompletionError> {
        match self.provider {
            ProviderId::Anthropic => {
                if body.get("type").and_then(Value::as_str) == Some("error") {
                    let message = body
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown Anthropic error");
                    return Err(CompletionError::MalformedResponse(message.to_string()));
                }
                body.pointer("/content/0/text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CompletionError::MalformedResponse("missing content text".to_string())
                    })
            }
            _ => {
                if let Some(error) = body.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string());
                    return Err(CompletionError::MalformedResponse(message));
                }
                body.pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CompletionError::MalformedResponse("missing choices".to_string())
                    })
            }
        }
    }

    async fn send(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        if self.api_key.trim().is_empty() {
            return Err(CompletionError::MissingApiKey(self.provider));
        }

        let payload = self.build_payload(system, user);
        let mut request = self.http.post(&self.endpoint).json(&payload);
        request = match self.provider {
            ProviderId::Anthropic => request
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            _ => request.bearer_auth(&self.api_key),
        };

        let response = request
            .send()
            .await
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_hint = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| retry::parse_retry_after(v, SystemTime::now()))
                .map(RetryHint::new);
            let message = response.text().await.unwrap_or_default();
            log::error!(
                "{} request failed with HTTP {}: {}",
                self.provider,
                status,
                message
            );
            return Err(CompletionError::Http {
                status: status.as_u16(),
                message,
                retry_hint,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
        self.parse_body(&body)
    }
}

impl Completion for LlmClient {
    fn complete(
        &self,
        system: &str,
        user: &str,
    ) -> impl Future<Output = Result<String, CompletionError>> + Send {
        let system = system.to_string();
        let user = user.to_string();
        async move { self.send(&system, &user).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_payload_shape() {
        let client = LlmClient::new(ProviderId::OpenAi, "gpt-test", "key");
        let payload = client.build_payload("sys", "usr");
        assert_eq!(payload["model"], "gpt-test");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "usr");
        assert_eq!(payload["max_tokens"], 4096);
    }

    #[test]
    fn anthropic_payload_uses_messages_api() {
        let client = LlmClient::new(ProviderId::Anthropic, "claude-test", "key");
        let payload = client.build_payload("sys", "usr");
        assert_eq!(payload["system"], "sys");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["max_tokens"], 8192);
        assert!(payload.get("top_p").is_none());
    }

    #[test]
    fn xai_payload_renames_token_field() {
        let client = LlmClient::new(ProviderId::XAi, "grok-test", "key");
        let payload = client.build_payload("sys", "usr");
        assert!(payload.get("max_tokens").is_none());
        assert_eq!(payload["max_completion_tokens"], 4096);
    }

    #[test]
    fn parses_openai_response() {
        let client = LlmClient::new(ProviderId::OpenAi, "m", "key");
        let body = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(client.parse_body(&body).unwrap(), "hello");
    }

    #[test]
    fn parses_anthropic_response() {
        let client = LlmClient::new(ProviderId::Anthropic, "m", "key");
        let body = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(client.parse_body(&body).unwrap(), "hello");
    }

    #[test]
    fn api_error_body_is_malformed_response() {
        let client = LlmClient::new(ProviderId::OpenAi, "m", "key");
        let body = json!({"error": {"message": "quota exceeded"}});
        let err = client.parse_body(&body).unwrap_err();
        assert!(matches!(err, CompletionError::MalformedResponse(m) if m == "quota exceeded"));
    }
}
