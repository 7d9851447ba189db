//! Shared upstream HTTP core.
//!
//! One keep-alive connection pool per provider (up to 50 idle sockets),
//! a per-provider timeout, and a retry loop with exponential backoff
//! (1 s base, 10 s cap) plus up to 50% jitter. Only transient failures
//! retry: 429, 5xx, and network errors. Error bodies are unwrapped from
//! both `{error:{message}}` and `[{error:{message}}]` shapes.

use super::ProviderError;
use crate::config::Provider;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const POOL_MAX_IDLE_PER_HOST: usize = 50;

/// Parsed non-streaming response.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: u16,
    pub data: serde_json::Value,
    pub attempt: u32,
    pub latency_ms: f64,
}

/// Streaming response handle: the reqwest response plus call metadata.
pub struct StreamResponse {
    pub response: reqwest::Response,
    pub status: u16,
    pub attempt: u32,
    pub latency_ms: f64,
}

/// Per-provider HTTP client with retry semantics.
pub struct HttpCore {
    client: reqwest::Client,
    provider: Provider,
    base_url: String,
    backoff_base: Duration,
}

impl HttpCore {
    pub fn new(provider: Provider, base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            provider,
            base_url: base_url.into(),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Override the base URL for compatibility endpoints and tests.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Shrink the backoff base so retry tests run quickly.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// POST a JSON body and parse a JSON response, retrying transient
    /// failures.
    pub async fn post_json(
        &self,
        path: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<JsonResponse, ProviderError> {
        let started = Instant::now();
        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
            match self.send(path, headers, body).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        let data: serde_json::Value = response.json().await.map_err(|e| {
                            self.wrap_network(e, attempt, "response body unreadable")
                        })?;
                        return Ok(JsonResponse {
                            status,
                            data,
                            attempt,
                            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                        });
                    }

                    let err = self.wrap_status(response, attempt).await;
                    if !err.retryable() {
                        return Err(err);
                    }
                    warn!(
                        provider = %self.provider,
                        status = err.status,
                        attempt,
                        "transient upstream error, will retry"
                    );
                    last_err = Some(err);
                }
                Err(e) => {
                    let err = self.wrap_network(e, attempt, "request failed");
                    debug!(provider = %self.provider, attempt, error = %err, "network error");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ProviderError {
            provider: self.provider,
            status: None,
            timed_out: false,
            attempt: MAX_ATTEMPTS,
            message: "all attempts exhausted".to_string(),
        }))
    }

    /// POST and hand back the raw response for streaming. Retries apply
    /// to the initial status only; body errors surface mid-stream.
    pub async fn post_stream(
        &self,
        path: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<StreamResponse, ProviderError> {
        let started = Instant::now();
        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
            match self.send(path, headers, body).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return Ok(StreamResponse {
                            response,
                            status,
                            attempt,
                            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                        });
                    }
                    let err = self.wrap_status(response, attempt).await;
                    if !err.retryable() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
                Err(e) => {
                    last_err = Some(self.wrap_network(e, attempt, "request failed"));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ProviderError {
            provider: self.provider,
            status: None,
            timed_out: false,
            attempt: MAX_ATTEMPTS,
            message: "all attempts exhausted".to_string(),
        }))
    }

    async fn send(
        &self,
        path: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("content-type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        request.json(body).send().await
    }

    /// Exponential backoff with up to 50% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(2));
        let capped = exp.min(BACKOFF_CAP);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        capped.mul_f64(1.0 + jitter)
    }

    async fn wrap_status(&self, response: reqwest::Response, attempt: u32) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ProviderError {
            provider: self.provider,
            status: Some(status),
            timed_out: false,
            attempt,
            message: extract_error_message(&body),
        }
    }

    fn wrap_network(&self, e: reqwest::Error, attempt: u32, context: &str) -> ProviderError {
        ProviderError {
            provider: self.provider,
            status: e.status().map(|s| s.as_u16()),
            timed_out: e.is_timeout(),
            attempt,
            message: format!("{context}: {e}"),
        }
    }
}

/// Unwrap the provider's error message, supporting both the object and
/// array envelope shapes; falls back to the (truncated) raw body.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidate = value
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| {
                value
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(|v| v.get("error"))
                    .and_then(|e| e.get("message"))
            })
            .and_then(|m| m.as_str());
        if let Some(message) = candidate {
            return message.to_string();
        }
    }
    let mut raw = body.trim().to_string();
    if raw.len() > 200 {
        raw.truncate(200);
    }
    if raw.is_empty() {
        "upstream error with empty body".to_string()
    } else {
        raw
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
