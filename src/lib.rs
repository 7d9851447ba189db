//! # fractal-gateway
//!
//! A multi-provider inference gateway. Clients speak the OpenAI-compatible
//! chat-completion wire format; the gateway classifies each prompt, scores
//! every viable upstream model along six axes, and dispatches to whichever
//! one best serves the tenant's strategy while honoring circuit-breaker
//! state, rate limits, and monthly budgets.
//!
//! ## Request pipeline
//!
//! ```text
//! auth → rate-limit → cache lookup → classifier → router → breaker gate
//!      → provider adapter → cost compute → cache store → log queue
//!      → bandit feedback → response
//! ```

use thiserror::Error;

pub mod api;
pub mod bandit;
pub mod bench;
pub mod breaker;
pub mod cache;
pub mod classify;
pub mod config;
pub mod providers;
pub mod queue;
pub mod routing;
pub mod storage;
pub mod tenants;

// Re-exports for the common entry points
pub use classify::{Classification, Classifier, Intent, Tier};
pub use config::{GatewayConfig, ModelEntry, Provider, Strategy};
pub use routing::{ModelRouter, RouteDecision};

/// Gateway-internal errors.
///
/// Provider failures carry their own richer type
/// ([`providers::ProviderError`]); this enum covers everything else.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("channel closed unexpectedly")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Hash a prompt to its cache key: 16 hex chars of SHA-256 over the
/// trimmed, lowercased text. Deterministic; collision resistance beyond
/// 64 bits is not needed here.
pub fn prompt_hash(prompt: &str) -> String {
    use sha2::{Digest, Sha256};
    let normalized = prompt.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_hash_deterministic() {
        assert_eq!(prompt_hash("Hello world"), prompt_hash("Hello world"));
    }

    #[test]
    fn test_prompt_hash_normalizes_case_and_whitespace() {
        assert_eq!(prompt_hash("  Hello World  "), prompt_hash("hello world"));
    }

    #[test]
    fn test_prompt_hash_is_16_hex_chars() {
        let h = prompt_hash("anything");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_prompt_hash_distinct_inputs_differ() {
        assert_ne!(prompt_hash("hello"), prompt_hash("goodbye"));
    }
}
