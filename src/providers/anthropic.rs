//! Anthropic adapter, the one upstream that needs real translation.
//!
//! Requests: `system` messages move into the Anthropic `system` field,
//! everything else into `messages`; `max_tokens` is mandatory upstream
//! so a default is supplied. Responses are reshaped to the canonical
//! completion object.
//!
//! Streaming: Anthropic SSE events are rewritten into canonical
//! `chat.completion.chunk` frames by [`SseTranslator`], a pure
//! bytes-in/frames-out transform with a private buffer for incomplete
//! lines. Event mapping:
//!
//! | Anthropic event       | Canonical output                            |
//! |-----------------------|---------------------------------------------|
//! | `message_start`       | (captures input tokens, no frame)           |
//! | `content_block_delta` | chunk carrying `delta.content`              |
//! | `message_delta`       | terminal chunk, `finish_reason: "stop"` + usage |
//! | `message_stop`        | `data: [DONE]`                              |

use super::http::HttpCore;
use super::{ChatOutcome, ChatProvider, ChatRequest, ProviderError, StreamOutcome, StreamUsage};
use crate::config::Provider;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    core: HttpCore,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            core: HttpCore::new(
                Provider::Anthropic,
                "https://api.anthropic.com/v1",
                Duration::from_secs(120),
            ),
            api_key,
        }
    }

    /// Point the adapter at a mock server (tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.core = self.core.with_base_url(url);
        self
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ]
    }
}

/// Build the Anthropic request body from a canonical request.
fn translate_request(req: &ChatRequest, stream: bool) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for m in &req.messages {
        if m.role == "system" {
            system_parts.push(&m.content);
        } else {
            messages.push(json!({"role": m.role, "content": m.content}));
        }
    }

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n"));
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

/// Reshape an Anthropic messages response into the canonical completion.
fn translate_response(data: &Value) -> Value {
    let text: String = data["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default();

    let finish_reason = match data["stop_reason"].as_str() {
        Some("max_tokens") => "length",
        _ => "stop",
    };

    let input_tokens = data["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0);

    json!({
        "id": format!("chatcmpl-{}", data["id"].as_str().unwrap_or("anthropic")),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": data["model"],
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens
        }
    })
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let body = translate_request(req, false);
        let resp = self.core.post_json("/messages", &self.headers(), &body).await?;

        let data = translate_response(&resp.data);
        let input_tokens = data["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let output_tokens = data["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(ChatOutcome {
            data,
            latency_ms: resp.latency_ms,
            attempt: resp.attempt,
            input_tokens,
            output_tokens,
            status: resp.status,
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<StreamOutcome, ProviderError> {
        let body = translate_request(req, true);
        let out = self
            .core
            .post_stream("/messages", &self.headers(), &body)
            .await?;

        let translator = SseTranslator::new(&req.model);
        let usage = translator.usage_handle();

        let stream = out
            .response
            .bytes_stream()
            .scan(translator, |translator, chunk| {
                let frames: Vec<Result<Vec<u8>, ProviderError>> = match chunk {
                    Ok(bytes) => translator
                        .push(&bytes)
                        .into_iter()
                        .map(|f| Ok(f.into_bytes()))
                        .collect(),
                    Err(e) => vec![Err(ProviderError {
                        provider: Provider::Anthropic,
                        status: None,
                        timed_out: e.is_timeout(),
                        attempt: 1,
                        message: format!("stream read failed: {e}"),
                    })],
                };
                futures::future::ready(Some(futures::stream::iter(frames)))
            })
            .flatten()
            .boxed();

        Ok(StreamOutcome {
            stream,
            latency_ms: out.latency_ms,
            attempt: out.attempt,
            status: out.status,
            usage: Some(usage),
        })
    }
}

/// Stateful Anthropic-SSE → canonical-SSE transform.
///
/// Line-buffered: only complete lines are parsed, and an incomplete
/// trailing fragment is kept in the buffer for the next push. One
/// translator per stream; no state is shared between requests.
pub struct SseTranslator {
    buffer: Vec<u8>,
    chunk_id: String,
    model: String,
    created: i64,
    usage: Arc<StreamUsage>,
}

impl SseTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            buffer: Vec::new(),
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            usage: Arc::new(StreamUsage::default()),
        }
    }

    /// Shared token-count handle, updated as usage events arrive.
    pub fn usage_handle(&self) -> Arc<StreamUsage> {
        Arc::clone(&self.usage)
    }

    /// Feed raw upstream bytes; returns zero or more complete canonical
    /// SSE frames.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            // A complete line is valid UTF-8; chunk splits only ever leave
            // partial lines in the buffer.
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.handle_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn handle_line(&mut self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data: ")?;
        let event: Value = serde_json::from_str(payload).ok()?;

        match event["type"].as_str() {
            Some("message_start") => {
                if let Some(tokens) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens.store(tokens, Ordering::Relaxed);
                }
                None
            }
            Some("content_block_delta") => {
                let text = event["delta"]["text"].as_str().unwrap_or_default();
                let chunk = json!({
                    "id": self.chunk_id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {"content": text},
                        "finish_reason": null
                    }]
                });
                Some(format!("data: {chunk}\n\n"))
            }
            Some("message_delta") => {
                if let Some(tokens) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens.store(tokens, Ordering::Relaxed);
                }
                let (input_tokens, output_tokens) = self.usage.totals();
                let chunk = json!({
                    "id": self.chunk_id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {},
                        "finish_reason": "stop"
                    }],
                    "usage": {
                        "prompt_tokens": input_tokens,
                        "completion_tokens": output_tokens,
                        "total_tokens": input_tokens + output_tokens
                    }
                });
                Some(format!("data: {chunk}\n\n"))
            }
            Some("message_stop") => Some("data: [DONE]\n\n".to_string()),
            _ => None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
