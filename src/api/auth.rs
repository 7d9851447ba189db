//! Request authentication.
//!
//! Keys arrive as `Authorization: Bearer <key>` or `x-api-key`. Keys
//! with an upstream vendor prefix (`sk-`, `ant-`) pass through with no
//! tenant attached; gateway-issued `fra_` keys must authenticate; other
//! prefixes (and no key at all) are treated as anonymous. A tenant over
//! its monthly budget is rejected here, before any classification work.

use super::error::ApiError;
use super::AppState;
use crate::tenants::{Tenant, KEY_PREFIX};
use axum::http::HeaderMap;
use tracing::debug;

/// Vendor key prefixes that bypass tenant auth entirely.
const PASSTHROUGH_PREFIXES: &[&str] = &["sk-", "ant-"];

/// Who is making this request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// `None` for pass-through and anonymous callers.
    pub tenant: Option<Tenant>,
}

/// Pull the API key out of the request headers.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Authenticate the request and enforce the budget gate.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let key = match extract_api_key(headers) {
        Some(k) if !k.is_empty() => k,
        _ => return Ok(AuthContext::default()),
    };

    if PASSTHROUGH_PREFIXES.iter().any(|p| key.starts_with(p)) {
        debug!("vendor-prefixed key, passing through without tenant");
        return Ok(AuthContext::default());
    }

    if key.starts_with(KEY_PREFIX) {
        let tenant = state
            .tenants
            .authenticate(&key)
            .await
            .map_err(|_| ApiError::invalid_api_key())?
            .ok_or_else(ApiError::invalid_api_key)?;

        if !tenant.within_budget() {
            return Err(ApiError::budget_exceeded());
        }
        return Ok(AuthContext {
            tenant: Some(tenant),
        });
    }

    // Unrecognized prefix: anonymous pass-through
    Ok(AuthContext::default())
}

// ── Tests ──────────────────────────────────────────────────────────────
