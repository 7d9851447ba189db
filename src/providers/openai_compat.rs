//! Pass-through adapter for OpenAI-compatible upstreams.
//!
//! OpenAI and Groq speak the wire format natively; Gemini and Cohere
//! expose compatibility endpoints that do. The payload is forwarded
//! as-is and responses come back already in the canonical shape, so the
//! adapter only adds auth, retries, and usage extraction.

use super::http::HttpCore;
use super::{usage_tokens, ChatOutcome, ChatProvider, ChatRequest, ProviderError, StreamOutcome};
use crate::config::Provider;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

pub struct OpenAiCompatProvider {
    core: HttpCore,
    provider: Provider,
    api_key: String,
}

impl OpenAiCompatProvider {
    pub fn openai(api_key: String) -> Self {
        Self {
            core: HttpCore::new(
                Provider::OpenAi,
                "https://api.openai.com/v1",
                Duration::from_secs(90),
            ),
            provider: Provider::OpenAi,
            api_key,
        }
    }

    pub fn groq(api_key: String) -> Self {
        Self {
            core: HttpCore::new(
                Provider::Groq,
                "https://api.groq.com/openai/v1",
                Duration::from_secs(60),
            ),
            provider: Provider::Groq,
            api_key,
        }
    }

    pub fn gemini(api_key: String) -> Self {
        Self {
            core: HttpCore::new(
                Provider::Gemini,
                "https://generativelanguage.googleapis.com/v1beta/openai",
                Duration::from_secs(90),
            ),
            provider: Provider::Gemini,
            api_key,
        }
    }

    pub fn cohere(api_key: String) -> Self {
        Self {
            core: HttpCore::new(
                Provider::Cohere,
                "https://api.cohere.ai/compatibility/v1",
                Duration::from_secs(120),
            ),
            provider: Provider::Cohere,
            api_key,
        }
    }

    /// Point the adapter at a mock server (tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.core = self.core.with_base_url(url);
        self
    }

    /// Shrink retry backoff (tests).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.core = self.core.with_backoff_base(base);
        self
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("authorization", format!("Bearer {}", self.api_key))]
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let body = serde_json::to_value(req).map_err(|e| ProviderError {
            provider: self.provider,
            status: None,
            timed_out: false,
            attempt: 0,
            message: format!("request serialization failed: {e}"),
        })?;

        let resp = self
            .core
            .post_json("/chat/completions", &self.headers(), &body)
            .await?;
        let (input_tokens, output_tokens) = usage_tokens(&resp.data);

        Ok(ChatOutcome {
            data: resp.data,
            latency_ms: resp.latency_ms,
            attempt: resp.attempt,
            input_tokens,
            output_tokens,
            status: resp.status,
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<StreamOutcome, ProviderError> {
        let mut body = serde_json::to_value(req).map_err(|e| ProviderError {
            provider: self.provider,
            status: None,
            timed_out: false,
            attempt: 0,
            message: format!("request serialization failed: {e}"),
        })?;
        body["stream"] = serde_json::Value::Bool(true);

        let out = self
            .core
            .post_stream("/chat/completions", &self.headers(), &body)
            .await?;

        let provider = self.provider;
        let stream = out
            .response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => Ok(bytes.to_vec()),
                Err(e) => Err(ProviderError {
                    provider,
                    status: None,
                    timed_out: e.is_timeout(),
                    attempt: 1,
                    message: format!("stream read failed: {e}"),
                }),
            })
            .boxed();

        Ok(StreamOutcome {
            stream,
            latency_ms: out.latency_ms,
            attempt: out.attempt,
            status: out.status,
            usage: None,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            temperature: Some(0.3),
            top_p: None,
            max_tokens: None,
            stream: false,
        }
    }

    fn completion_body() -> serde_json::Value {
        json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        })
    }

    #[tokio::test]
    async fn test_chat_forwards_payload_and_extracts_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatProvider::openai("sk-test".to_string()).with_base_url(server.uri());
        let outcome = provider.chat(&request()).await.unwrap();

        assert_eq!(outcome.input_tokens, 5);
        assert_eq!(outcome.output_tokens, 3);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.data["choices"][0]["message"]["content"], "hi there");

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["model"], "gpt-4o-mini");
        assert_eq!(sent["messages"][0]["content"], "hello");
        assert!(sent.get("strategy").is_none(), "no internal fields upstream");
    }

    #[tokio::test]
    async fn test_chat_error_carries_provider_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"error": {"message": "model does not exist"}})),
            )
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatProvider::groq("gsk-test".to_string()).with_base_url(server.uri());
        let err = provider.chat(&request()).await.unwrap_err();
        assert_eq!(err.provider, Provider::Groq);
        assert_eq!(err.status, Some(404));
        assert_eq!(err.message, "model does not exist");
    }

    #[tokio::test]
    async fn test_chat_stream_sets_stream_flag_and_forwards_bytes() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse)
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatProvider::gemini("g-test".to_string()).with_base_url(server.uri());
        let outcome = provider.chat_stream(&request()).await.unwrap();

        let frames: Vec<Vec<u8>> = outcome
            .stream
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await;
        let joined = String::from_utf8(frames.concat()).unwrap();
        assert!(joined.contains("\"content\":\"hi\""));
        assert!(joined.ends_with("data: [DONE]\n\n"));

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["stream"], true);
    }

    #[test]
    fn test_constructor_base_urls() {
        // Sanity-check the compat endpoints don't drift
        let p = OpenAiCompatProvider::cohere("k".to_string());
        assert_eq!(p.provider(), Provider::Cohere);
        let p = OpenAiCompatProvider::gemini("k".to_string());
        assert_eq!(p.provider(), Provider::Gemini);
    }
}
