//! Health, catalog, and dashboard endpoints.

use super::error::ApiError;
use super::AppState;
use crate::bandit::RewardSignal;
use crate::config::{Strategy, CATALOG};
use crate::storage::FeedbackRow;
use crate::tenants::NewTenant;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Readiness plus operational vitals.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    // Storage reachability is the readiness signal
    match state.storage.stats().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "version": env!("CARGO_PKG_VERSION"),
                "mock_mode": state.providers.mock_mode(),
                "queue_depth": state.queue.depth(),
                "queue_degraded": state.queue.is_degraded(),
                "active_requests": state.inflight.active(),
                "breakers": state.breakers.snapshots(),
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "health check: storage unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "not ready"})),
            )
                .into_response()
        }
    }
}

/// Model catalog in the OpenAI list shape.
pub async fn list_models() -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = CATALOG
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.provider.as_str(),
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

/// Dashboard aggregates.
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state
        .storage
        .stats()
        .await
        .map_err(|_| ApiError::service_unavailable("storage unavailable"))?;

    let bandit_means: Vec<serde_json::Value> = CATALOG
        .iter()
        .map(|m| json!({"model": m.id, "mean": state.bandit.global_mean(m.id)}))
        .collect();

    Ok(Json(json!({
        "requests": summary,
        "cache": state.cache.stats(),
        "breakers": state.breakers.snapshots(),
        "bandit": bandit_means,
        "active_requests": state.inflight.active(),
        "queue_depth": state.queue.depth(),
    })))
}

/// Strategies and the model catalog.
pub async fn config() -> Json<serde_json::Value> {
    let strategies: Vec<serde_json::Value> = Strategy::all()
        .iter()
        .map(|s| json!({"name": s.as_str(), "weights": s.weights()}))
        .collect();
    Json(json!({"strategies": strategies, "models": CATALOG}))
}

/// Live benchmark snapshot per model.
pub async fn benchmarks(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"models": state.bench.snapshot_all()}))
}

/// Create a tenant. The plaintext key appears in this response and
/// nowhere else, ever.
pub async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewTenant>,
) -> Result<Response, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::invalid_request("tenant name must not be empty"));
    }
    if let Some(budget) = req.budget_limit_monthly {
        if budget < 0.0 {
            return Err(ApiError::invalid_request("budget must be non-negative"));
        }
    }

    let (tenant, api_key) = state
        .tenants
        .issue(req)
        .await
        .map_err(|_| ApiError::service_unavailable("tenant creation failed"))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"tenant": tenant, "api_key": api_key})),
    )
        .into_response())
}

/// List tenants. Key hashes are skipped by `Tenant`'s serializer.
pub async fn list_tenants(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenants = state
        .tenants
        .list()
        .await
        .map_err(|_| ApiError::service_unavailable("storage unavailable"))?;
    Ok(Json(json!({"tenants": tenants})))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub request_id: String,
    pub model: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Explicit quality on a 0–10 scale.
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// Accept an explicit reward signal: persisted for recomputes and
/// applied to the live posteriors immediately.
pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(q) = req.quality {
        if !(0.0..=10.0).contains(&q) {
            return Err(ApiError::invalid_request("quality must be in 0..=10"));
        }
    }
    if crate::config::find_model(&req.model).is_none() {
        return Err(ApiError::invalid_request(format!(
            "unknown model: {}",
            req.model
        )));
    }

    let signal = RewardSignal {
        success: req.success,
        quality: req.quality,
        latency_ms: req.latency_ms,
        cost: req.cost,
    };
    state
        .bandit
        .record(req.tenant_id.as_deref(), &req.model, &signal);

    let row = FeedbackRow {
        request_id: req.request_id,
        model: req.model,
        tenant_id: req.tenant_id,
        quality: req.quality,
        latency_ms: req.latency_ms,
        cost: req.cost,
        success: req.success.unwrap_or(true),
        created_at: Utc::now(),
    };
    if let Err(e) = state.storage.insert_feedback(&row).await {
        // Feedback persistence failures degrade silently; the live
        // posterior already took the update.
        warn!(error = %e, "feedback write failed");
    }

    Ok(Json(json!({"ok": true})))
}
