//! Typed API errors and the wire error envelope.
//!
//! Every failure surfaces as `{"error": {"message", "type", "code"?,
//! "requestId"?}}` with the HTTP status implied by the kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error category → HTTP status + wire `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    BudgetExceeded,
    RateLimited,
    ConcurrencyLimit,
    ServiceUnavailable,
    Provider,
    Internal,
}

impl ErrorKind {
    fn type_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::BudgetExceeded => "quota_exceeded",
            ErrorKind::RateLimited | ErrorKind::ConcurrencyLimit => "rate_limit_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Provider => "provider_error",
            ErrorKind::Internal => "internal_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ErrorKind::Authentication => Some("invalid_api_key"),
            ErrorKind::BudgetExceeded => Some("budget_exceeded"),
            ErrorKind::RateLimited => Some("rate_limit"),
            ErrorKind::ConcurrencyLimit => Some("concurrency_limit"),
            _ => None,
        }
    }
}

/// An API-visible failure.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: StatusCode,
    pub request_id: Option<String>,
}

impl ApiError {
    fn new(kind: ErrorKind, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status,
            request_id: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, StatusCode::BAD_REQUEST, message)
    }

    pub fn invalid_api_key() -> Self {
        Self::new(
            ErrorKind::Authentication,
            StatusCode::UNAUTHORIZED,
            "invalid API key",
        )
    }

    pub fn budget_exceeded() -> Self {
        Self::new(
            ErrorKind::BudgetExceeded,
            StatusCode::TOO_MANY_REQUESTS,
            "monthly budget exceeded",
        )
    }

    pub fn rate_limited() -> Self {
        Self::new(
            ErrorKind::RateLimited,
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
        )
    }

    pub fn concurrency_limit() -> Self {
        Self::new(
            ErrorKind::ConcurrencyLimit,
            StatusCode::TOO_MANY_REQUESTS,
            "too many concurrent requests",
        )
    }

    pub fn breaker_open(provider: &str) -> Self {
        Self::new(
            ErrorKind::ServiceUnavailable,
            StatusCode::SERVICE_UNAVAILABLE,
            format!("provider {provider} temporarily unavailable"),
        )
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ServiceUnavailable,
            StatusCode::SERVICE_UNAVAILABLE,
            message,
        )
    }

    /// Wrap the final upstream failure: the provider's own status when
    /// it sent one, else 502.
    pub fn provider(err: &crate::providers::ProviderError) -> Self {
        let status =
            StatusCode::from_u16(err.client_status()).unwrap_or(StatusCode::BAD_GATEWAY);
        Self::new(
            ErrorKind::Provider,
            status,
            format!("{} upstream error: {}", err.provider, err.message),
        )
    }

    pub fn internal(request_id: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorKind::Internal,
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error",
        );
        err.request_id = Some(request_id.into());
        err
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "message": self.message,
            "type": self.kind.type_str(),
        });
        if let Some(code) = self.kind.code() {
            error["code"] = json!(code);
        }
        if let Some(request_id) = &self.request_id {
            error["requestId"] = json!(request_id);
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
