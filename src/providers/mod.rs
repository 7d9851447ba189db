//! Provider adapters.
//!
//! Every upstream implements [`ChatProvider`]: an OpenAI-compatible
//! request in, a canonical completion (or canonical SSE stream) out.
//! OpenAI and Groq accept the payload natively; Gemini and Cohere are
//! reached through their OpenAI-compatibility endpoints; Anthropic is
//! the one translating adapter. All share the retry/backoff HTTP core
//! in [`http`].

pub mod anthropic;
pub mod http;
pub mod mock;
pub mod openai_compat;

pub use anthropic::{AnthropicProvider, SseTranslator};
pub use mock::MockProvider;
pub use openai_compat::OpenAiCompatProvider;

use crate::config::{GatewayConfig, Provider};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One chat message in the universal wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The body forwarded upstream. Internal routing fields (`strategy`)
/// are stripped before this is built.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ChatRequest {
    /// Concatenated user-message content, used for classification and
    /// cache hashing.
    pub fn user_content(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Upstream call failure, normalized across vendors.
#[derive(Debug, Clone, Error)]
#[error("{provider} error (status {status:?}, attempt {attempt}): {message}")]
pub struct ProviderError {
    pub provider: Provider,
    pub status: Option<u16>,
    pub timed_out: bool,
    pub attempt: u32,
    pub message: String,
}

impl ProviderError {
    /// HTTP status to surface to the client: the upstream's own status
    /// when present, else 502.
    pub fn client_status(&self) -> u16 {
        self.status.unwrap_or(502)
    }

    /// Transient failures worth retrying: 429, 5xx, or network errors.
    pub fn retryable(&self) -> bool {
        match self.status {
            Some(429) => true,
            Some(s) => s >= 500,
            None => true,
        }
    }
}

/// Result of a non-streaming upstream call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Canonical OpenAI-shape completion object.
    pub data: serde_json::Value,
    pub latency_ms: f64,
    pub attempt: u32,
    /// Actual token counts as reported by the upstream.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status: u16,
}

/// Token counts accumulated while a stream is piped; written by the
/// adapter, read by the orchestrator at end-of-stream.
#[derive(Debug, Default)]
pub struct StreamUsage {
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
}

impl StreamUsage {
    pub fn totals(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }
}

/// Result of a streaming upstream call. The stream yields canonical
/// SSE frames ready to pipe to the client.
pub struct StreamOutcome {
    pub stream: BoxStream<'static, Result<Vec<u8>, ProviderError>>,
    /// Time to response headers.
    pub latency_ms: f64,
    pub attempt: u32,
    pub status: u16,
    /// Present when the adapter can account tokens mid-stream.
    pub usage: Option<Arc<StreamUsage>>,
}

/// Uniform upstream contract.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// One complete chat round-trip in the canonical shape.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError>;

    /// Open a canonical SSE stream for the request.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<StreamOutcome, ProviderError>;
}

/// All configured providers. Built once at startup from the environment;
/// when no upstream key exists, only the mock provider is registered and
/// every dispatch is served canned.
pub struct ProviderRegistry {
    providers: HashMap<Provider, Arc<dyn ChatProvider>>,
    mock_mode: bool,
}

impl ProviderRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut providers: HashMap<Provider, Arc<dyn ChatProvider>> = HashMap::new();

        if let Some(key) = &config.openai_api_key {
            providers.insert(
                Provider::OpenAi,
                Arc::new(OpenAiCompatProvider::openai(key.clone())),
            );
        }
        if let Some(key) = &config.anthropic_api_key {
            providers.insert(
                Provider::Anthropic,
                Arc::new(AnthropicProvider::new(key.clone())),
            );
        }
        if let Some(key) = &config.gemini_api_key {
            providers.insert(
                Provider::Gemini,
                Arc::new(OpenAiCompatProvider::gemini(key.clone())),
            );
        }
        if let Some(key) = &config.groq_api_key {
            providers.insert(
                Provider::Groq,
                Arc::new(OpenAiCompatProvider::groq(key.clone())),
            );
        }
        if let Some(key) = &config.cohere_api_key {
            providers.insert(
                Provider::Cohere,
                Arc::new(OpenAiCompatProvider::cohere(key.clone())),
            );
        }

        let mock_mode = providers.is_empty();
        providers.insert(Provider::Mock, Arc::new(MockProvider::new()));

        Self {
            providers,
            mock_mode,
        }
    }

    /// Registry with a single injected provider (tests).
    pub fn single(provider: Provider, adapter: Arc<dyn ChatProvider>) -> Self {
        let mut providers: HashMap<Provider, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert(provider, adapter);
        providers.insert(Provider::Mock, Arc::new(MockProvider::new()));
        Self {
            providers,
            mock_mode: false,
        }
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(&provider).cloned()
    }

    pub fn mock_mode(&self) -> bool {
        self.mock_mode
    }
}

/// Pull token counts out of a canonical completion's `usage` member.
pub fn usage_tokens(data: &serde_json::Value) -> (u64, u64) {
    let usage = &data["usage"];
    (
        usage["prompt_tokens"].as_u64().unwrap_or(0),
        usage["completion_tokens"].as_u64().unwrap_or(0),
    )
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_serializes_without_unset_options() {
        let req = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("temperature").is_none());
        assert!(v.get("stream").is_none(), "stream=false is omitted");
    }

    #[test]
    fn test_chat_request_serializes_stream_true() {
        let req = ChatRequest {
            model: "m".to_string(),
            messages: vec![],
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(64),
            stream: true,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["stream"], true);
        assert_eq!(v["max_tokens"], 64);
    }

    #[test]
    fn test_user_content_joins_only_user_messages() {
        let req = ChatRequest {
            model: "m".to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "be brief".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "first".to_string(),
                },
                ChatMessage {
                    role: "assistant".to_string(),
                    content: "ok".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "second".to_string(),
                },
            ],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
        };
        assert_eq!(req.user_content(), "first\nsecond");
    }

    #[test]
    fn test_provider_error_client_status_defaults_502() {
        let err = ProviderError {
            provider: Provider::OpenAi,
            status: None,
            timed_out: true,
            attempt: 3,
            message: "connect timeout".to_string(),
        };
        assert_eq!(err.client_status(), 502);
        assert!(err.retryable());
    }

    #[test]
    fn test_provider_error_retryable_matrix() {
        let mk = |status: Option<u16>| ProviderError {
            provider: Provider::Groq,
            status,
            timed_out: false,
            attempt: 1,
            message: String::new(),
        };
        assert!(mk(Some(429)).retryable());
        assert!(mk(Some(500)).retryable());
        assert!(mk(Some(503)).retryable());
        assert!(mk(None).retryable());
        assert!(!mk(Some(400)).retryable());
        assert!(!mk(Some(401)).retryable());
        assert!(!mk(Some(404)).retryable());
    }

    #[test]
    fn test_usage_tokens_extraction() {
        let data = serde_json::json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
        });
        assert_eq!(usage_tokens(&data), (12, 34));
        assert_eq!(usage_tokens(&serde_json::json!({})), (0, 0));
    }

    #[test]
    fn test_registry_mock_mode_when_no_keys() {
        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            db_path: String::new(),
            classifier_path: None,
            openai_api_key: None,
            anthropic_api_key: None,
            gemini_api_key: None,
            groq_api_key: None,
            cohere_api_key: None,
        };
        let registry = ProviderRegistry::from_config(&config);
        assert!(registry.mock_mode());
        assert!(registry.get(Provider::Mock).is_some());
        assert!(registry.get(Provider::OpenAi).is_none());
    }

    #[test]
    fn test_registry_registers_configured_providers() {
        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            db_path: String::new(),
            classifier_path: None,
            openai_api_key: Some("sk-test".to_string()),
            anthropic_api_key: Some("ant-test".to_string()),
            gemini_api_key: None,
            groq_api_key: None,
            cohere_api_key: None,
        };
        let registry = ProviderRegistry::from_config(&config);
        assert!(!registry.mock_mode());
        assert!(registry.get(Provider::OpenAi).is_some());
        assert!(registry.get(Provider::Anthropic).is_some());
        assert!(registry.get(Provider::Gemini).is_none());
    }
}
