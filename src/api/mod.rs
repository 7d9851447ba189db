//! HTTP surface.
//!
//! Assembles the axum router over a shared [`AppState`]: the completion
//! orchestrator on `/v1/chat/completions`, the OpenAI-shape catalog on
//! `/v1/models`, health, and the dashboard/admin endpoints under
//! `/api/*`.

pub mod admin;
pub mod auth;
pub mod completions;
pub mod error;
pub mod rate_limit;

pub use error::ApiError;
pub use rate_limit::{Inflight, RateLimiter, MAX_CONCURRENT_REQUESTS};

use crate::bandit::BanditEngine;
use crate::bench::Benchmarker;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::{CacheConfig, SemanticCache};
use crate::classify::Classifier;
use crate::config::GatewayConfig;
use crate::providers::ProviderRegistry;
use crate::queue::{LogQueue, QueueConfig};
use crate::routing::ModelRouter;
use crate::storage::Storage;
use crate::tenants::TenantManager;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Everything a request handler can reach. One instance per process,
/// shared by `Arc`.
pub struct AppState {
    pub config: GatewayConfig,
    pub classifier: Classifier,
    pub router: ModelRouter,
    pub breakers: Arc<BreakerRegistry>,
    pub cache: Arc<SemanticCache>,
    pub bandit: Arc<BanditEngine>,
    pub bench: Arc<Benchmarker>,
    pub tenants: Arc<TenantManager>,
    pub providers: Arc<ProviderRegistry>,
    pub storage: Arc<Storage>,
    pub queue: Arc<LogQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub inflight: Arc<Inflight>,
}

impl AppState {
    /// Wire up every component from configuration and an opened store.
    pub fn build(config: GatewayConfig, storage: Arc<Storage>) -> Arc<Self> {
        let classifier = Classifier::from_weight_path(config.classifier_path.as_deref());
        let providers = Arc::new(ProviderRegistry::from_config(&config));
        let queue = LogQueue::spawn(Arc::clone(&storage), QueueConfig::default());

        Arc::new(Self {
            config,
            classifier,
            router: ModelRouter::new(),
            breakers: Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            cache: Arc::new(SemanticCache::new(CacheConfig::default())),
            bandit: Arc::new(BanditEngine::new()),
            bench: Arc::new(Benchmarker::new()),
            tenants: Arc::new(TenantManager::new(Arc::clone(&storage))),
            providers,
            storage,
            queue,
            rate_limiter: Arc::new(RateLimiter::new()),
            inflight: Arc::new(Inflight::new(MAX_CONCURRENT_REQUESTS)),
        })
    }
}

/// Build the full route table.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/v1/chat/completions", post(completions::chat_completions))
        .route("/v1/models", get(admin::list_models))
        .route("/api/stats", get(admin::stats))
        .route("/api/config", get(admin::config))
        .route("/api/benchmarks", get(admin::benchmarks))
        .route(
            "/api/tenants",
            post(admin::create_tenant).get(admin::list_tenants),
        )
        .route("/api/feedback", post(admin::submit_feedback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
