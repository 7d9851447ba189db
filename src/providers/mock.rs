//! Canned-completion provider.
//!
//! Serves when no upstream credential is configured, so the full
//! pipeline (classification, routing, caching, logging) can be
//! exercised without spending a cent. Token counts are estimated from
//! text length since there is no upstream to report them.

use super::{ChatOutcome, ChatProvider, ChatRequest, ProviderError, StreamOutcome, StreamUsage};
use crate::config::Provider;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const CANNED_REPLY: &str =
    "This is a mock completion from the gateway. Configure a provider API key \
     to reach a real model.";

/// Rough chars-per-token divisor for estimates.
const CHARS_PER_TOKEN: usize = 4;

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count().div_ceil(CHARS_PER_TOKEN)) as u64
}

#[derive(Debug, Default)]
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn provider(&self) -> Provider {
        Provider::Mock
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let input_tokens = estimate_tokens(&req.user_content());
        let output_tokens = estimate_tokens(CANNED_REPLY);

        let data = json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": req.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": CANNED_REPLY},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens
            }
        });

        Ok(ChatOutcome {
            data,
            latency_ms: 1.0,
            attempt: 1,
            input_tokens,
            output_tokens,
            status: 200,
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<StreamOutcome, ProviderError> {
        let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let created = Utc::now().timestamp();
        let model = req.model.clone();

        let input_tokens = estimate_tokens(&req.user_content());
        let output_tokens = estimate_tokens(CANNED_REPLY);
        let usage = Arc::new(StreamUsage::default());
        usage.input_tokens.store(input_tokens, Ordering::Relaxed);
        usage.output_tokens.store(output_tokens, Ordering::Relaxed);

        let mut frames: Vec<Result<Vec<u8>, ProviderError>> = CANNED_REPLY
            .split_inclusive(' ')
            .map(|word| {
                let chunk = json!({
                    "id": chunk_id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": {"content": word},
                        "finish_reason": null
                    }]
                });
                Ok(format!("data: {chunk}\n\n").into_bytes())
            })
            .collect();

        let terminal = json!({
            "id": chunk_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens
            }
        });
        frames.push(Ok(format!("data: {terminal}\n\n").into_bytes()));
        frames.push(Ok(b"data: [DONE]\n\n".to_vec()));

        Ok(StreamOutcome {
            stream: futures::stream::iter(frames).boxed(),
            latency_ms: 1.0,
            attempt: 1,
            status: 200,
            usage: Some(usage),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "Hello world".to_string(),
            }],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_chat_returns_canonical_shape() {
        let outcome = MockProvider::new().chat(&request()).await.unwrap();
        assert_eq!(outcome.data["object"], "chat.completion");
        assert_eq!(outcome.data["model"], "gpt-4o-mini");
        assert_eq!(outcome.data["choices"][0]["finish_reason"], "stop");
        assert!(outcome.input_tokens > 0);
        assert!(outcome.output_tokens > 0);
        assert_eq!(outcome.status, 200);
    }

    #[tokio::test]
    async fn test_chat_stream_ends_with_done_sentinel() {
        let outcome = MockProvider::new().chat_stream(&request()).await.unwrap();
        let frames: Vec<Vec<u8>> = outcome
            .stream
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await;
        let joined = String::from_utf8(frames.concat()).unwrap();
        assert!(joined.contains("chat.completion.chunk"));
        assert!(joined.trim_end().ends_with("data: [DONE]"));

        let usage = outcome.usage.unwrap();
        let (input, output) = usage.totals();
        assert!(input > 0 && output > 0);
    }
}
