//! The completion orchestrator: the hot path.
//!
//! For each request: authenticate, rate-limit, take an in-flight slot,
//! try the exact cache, classify, route, then walk the fallback list
//! (one candidate per provider, breaker-gated) until an upstream
//! succeeds. Cost comes from the provider's actual token counts. The
//! response is decorated with a `_routing` metadata block; accounting
//! (cache store, log row, bandit feedback, tenant usage) happens after
//! the response is produced.

use super::auth;
use super::error::ApiError;
use super::AppState;
use crate::bandit::RewardSignal;
use crate::classify::Classification;
use crate::config::{find_model, ModelEntry, Provider, Strategy};
use crate::providers::{ChatMessage, ChatOutcome, ChatRequest, ProviderError};
use crate::routing::{RouteDecision, RouteQuery, ScoredModel};
use crate::storage::RequestLogRow;
use crate::tenants::Tenant;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Incoming completion body. `strategy` is gateway-internal and is
/// stripped before anything is forwarded upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: CompletionRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::invalid_request(format!("malformed request body: {e}")))?;

    // Budget rejection happens inside authenticate, before any
    // classification work.
    let auth = auth::authenticate(&state, &headers).await?;

    let mut rate_remaining = None;
    if let Some(tenant) = &auth.tenant {
        let decision = state
            .rate_limiter
            .try_acquire(&tenant.id, tenant.rate_limit_rpm);
        if !decision.allowed {
            let mut resp = ApiError::rate_limited().into_response();
            resp.headers_mut().insert(
                "x-ratelimit-remaining",
                axum::http::HeaderValue::from_static("0"),
            );
            return Ok(resp);
        }
        rate_remaining = Some(decision.remaining);
    }

    let slot = state
        .inflight
        .try_enter()
        .ok_or_else(ApiError::concurrency_limit)?;

    let user_content = req
        .messages
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if user_content.trim().is_empty() {
        return Err(ApiError::invalid_request("no user message in request"));
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let strategy = resolve_strategy(&auth.tenant, req.strategy.as_deref());
    let prompt_hash = crate::prompt_hash(&user_content);

    // Exact-only cache path: no embedding is computed inline.
    if !req.stream {
        let cached = state.cache.lookup(&prompt_hash, None);
        if cached.hit {
            return Ok(serve_cache_hit(
                &state,
                &auth.tenant,
                &request_id,
                &user_content,
                strategy,
                cached.response.unwrap_or_default(),
                cached.model.unwrap_or_default(),
                rate_remaining,
            ));
        }
    }

    let classification = state.classifier.classify(&user_content);
    debug!(
        request_id = request_id.as_str(),
        tier = %classification.tier,
        score = classification.score,
        intent = %classification.intent,
        "prompt classified"
    );

    let decision = route_request(&state, &auth.tenant, &req, &classification, strategy);
    let fallback = fallback_candidates(&decision);

    let chat_req = |model: &str, stream: bool| ChatRequest {
        model: model.to_string(),
        messages: req.messages.clone(),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stream,
    };

    if req.stream {
        let streaming_req = chat_req(fallback[0].model.id, true);
        return serve_streaming(
            state,
            auth.tenant,
            request_id,
            user_content,
            strategy,
            classification,
            decision,
            streaming_req,
            slot,
        )
        .await;
    }

    // Non-streaming: walk the fallback list, one candidate per provider.
    let mut last_err: Option<ProviderError> = None;
    let mut success: Option<(ChatOutcome, ScoredModel)> = None;

    for cand in &fallback {
        let provider = dispatch_provider(&state, cand.model);
        let adapter = match state.providers.get(provider) {
            Some(a) => a,
            None => continue,
        };
        let permit = state.breakers.can_execute(provider);
        if !permit.allowed {
            debug!(provider = %provider, reason = permit.reason, "skipping gated provider");
            continue;
        }

        let started = Instant::now();
        match adapter.chat(&chat_req(cand.model.id, false)).await {
            Ok(outcome) => {
                state
                    .breakers
                    .record(provider, true, outcome.latency_ms, false);
                state
                    .bench
                    .record(cand.model.id, outcome.latency_ms, true, false);
                success = Some((outcome, (*cand).clone()));
                break;
            }
            Err(e) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                state.breakers.record(provider, false, elapsed_ms, e.timed_out);
                state
                    .bench
                    .record(cand.model.id, elapsed_ms, false, e.timed_out);
                warn!(
                    request_id = request_id.as_str(),
                    provider = %provider,
                    error = %e,
                    "provider failed, trying next candidate"
                );
                last_err = Some(e);
            }
        }
    }

    let (outcome, chosen) = match success {
        Some(pair) => pair,
        None => {
            return Err(match last_err {
                Some(e) => ApiError::provider(&e).with_request_id(request_id),
                None => ApiError::service_unavailable("no provider available")
                    .with_request_id(request_id),
            });
        }
    };

    // Cost and energy from the actual returned token counts.
    let cost = chosen
        .model
        .cost_for(outcome.input_tokens, outcome.output_tokens);
    let energy = request_energy(chosen.model, outcome.input_tokens + outcome.output_tokens);

    // Cache the clean canonical response before decorating it.
    state
        .cache
        .store(&prompt_hash, outcome.data.clone(), chosen.model.id, None);

    let mut data = outcome.data;
    data["_routing"] = json!({
        "requestId": request_id,
        "modelSelected": chosen.model.id,
        "provider": chosen.model.provider.as_str(),
        "strategy": strategy.as_str(),
        "complexity": classification.tier.as_str(),
        "complexityScore": classification.score,
        "confidence": classification.confidence,
        "intent": classification.intent.as_str(),
        "routingScore": chosen.score,
        "scoreBreakdown": chosen.breakdown,
        "latencyMs": outcome.latency_ms,
        "cost": cost,
        "energyIntensity": chosen.model.energy_intensity,
        "classifierMethod": classification.method.as_str(),
    });

    state.queue.enqueue_completion(log_row(
        &request_id,
        &auth.tenant,
        &user_content,
        &classification,
        chosen.model.id,
        chosen.model.provider.as_str(),
        strategy,
        outcome.input_tokens as i64,
        outcome.output_tokens as i64,
        cost,
        energy,
        outcome.latency_ms,
        Some(outcome.status as i64),
        false,
        &decision.reasoning,
    ));

    if let Some(tenant) = &auth.tenant {
        if let Err(e) = state.tenants.record_usage(tenant, cost).await {
            warn!(error = %e, "usage update failed");
        }
    }

    state.bandit.record(
        auth.tenant.as_ref().map(|t| t.id.as_str()),
        chosen.model.id,
        &RewardSignal {
            success: Some(true),
            quality: None,
            latency_ms: Some(outcome.latency_ms),
            cost: Some(cost),
        },
    );

    info!(
        request_id = request_id.as_str(),
        model = chosen.model.id,
        cost,
        latency_ms = outcome.latency_ms,
        "completion served"
    );

    let mut resp = Json(data).into_response();
    if let Some(remaining) = rate_remaining {
        if let Ok(value) = remaining.to_string().parse() {
            resp.headers_mut().insert("x-ratelimit-remaining", value);
        }
    }
    Ok(resp)
}

/// Strategy precedence: tenant default, then the request field, then
/// cost-first.
fn resolve_strategy(tenant: &Option<Tenant>, requested: Option<&str>) -> Strategy {
    if let Some(tenant) = tenant {
        return tenant.strategy;
    }
    match requested {
        Some(name) => name.parse().unwrap_or_else(|_| {
            warn!(strategy = name, "unknown strategy, using default");
            Strategy::default()
        }),
        None => Strategy::default(),
    }
}

fn route_request(
    state: &AppState,
    tenant: &Option<Tenant>,
    req: &CompletionRequest,
    classification: &Classification,
    strategy: Strategy,
) -> RouteDecision {
    let rl_scores = state
        .bandit
        .scores(tenant.as_ref().map(|t| t.id.as_str()));
    let benchmarks = state.bench.snapshot_all();

    // Providers with no configured adapter are as undispatchable as an
    // open circuit.
    let mut open = state.breakers.open_providers();
    if !state.providers.mock_mode() {
        for provider in Provider::upstreams() {
            if state.providers.get(*provider).is_none() {
                open.insert(*provider);
            }
        }
    }

    let allowlist = effective_allowlist(tenant, req.model.as_deref());

    let query = RouteQuery {
        classification,
        strategy,
        rl_scores: &rl_scores,
        benchmarks: &benchmarks,
        open_providers: &open,
        allowed_models: allowlist.as_deref(),
    };
    state.router.route(&query)
}

/// Merge the tenant allowlist with an explicit model request. A known
/// requested model narrows the list; an unknown one is ignored.
fn effective_allowlist(tenant: &Option<Tenant>, requested: Option<&str>) -> Option<Vec<String>> {
    let tenant_list = tenant.as_ref().and_then(|t| t.allowed_models.clone());
    match requested {
        Some(model) if find_model(model).is_some() => {
            let allowed_by_tenant = tenant
                .as_ref()
                .map(|t| t.model_allowed(model))
                .unwrap_or(true);
            if allowed_by_tenant {
                Some(vec![model.to_string()])
            } else {
                tenant_list
            }
        }
        _ => tenant_list,
    }
}

/// One candidate per distinct provider, selection first.
fn fallback_candidates(decision: &RouteDecision) -> Vec<&ScoredModel> {
    let mut seen = std::collections::HashSet::new();
    decision
        .candidates
        .iter()
        .filter(|c| seen.insert(c.model.provider))
        .collect()
}

fn dispatch_provider(state: &AppState, model: &ModelEntry) -> Provider {
    if state.providers.mock_mode() {
        Provider::Mock
    } else {
        model.provider
    }
}

/// Per-request energy figure: intensity scaled by tokens processed.
fn request_energy(model: &ModelEntry, total_tokens: u64) -> f64 {
    model.energy_intensity * total_tokens as f64 / 1000.0
}

#[allow(clippy::too_many_arguments)]
fn serve_cache_hit(
    state: &AppState,
    tenant: &Option<Tenant>,
    request_id: &str,
    user_content: &str,
    strategy: Strategy,
    mut response: serde_json::Value,
    model: String,
    rate_remaining: Option<u64>,
) -> Response {
    info!(request_id, "served from cache");

    response["_routing"] = json!({
        "requestId": request_id,
        "modelSelected": "cache",
        "provider": "cache",
        "strategy": strategy.as_str(),
        "cachedModel": model,
        "latencyMs": 0.0,
        "cost": 0.0,
        "cacheHit": true,
    });

    // Cache-hit rows are the shed class in degraded mode.
    state.queue.enqueue_cache_hit(RequestLogRow {
        request_id: request_id.to_string(),
        tenant_id: tenant.as_ref().map(|t| t.id.clone()),
        prompt_preview: preview(user_content),
        tier: "cached".to_string(),
        complexity_score: 0.0,
        confidence: 0.0,
        intent: "cached".to_string(),
        model,
        provider: "cache".to_string(),
        strategy: strategy.as_str().to_string(),
        input_tokens: 0,
        output_tokens: 0,
        cost: 0.0,
        energy: 0.0,
        latency_ms: 0.0,
        provider_status: None,
        cache_hit: true,
        reasoning: "exact cache hit".to_string(),
        created_at: Utc::now(),
    });

    let mut resp = Json(response).into_response();
    if let Some(remaining) = rate_remaining {
        if let Ok(value) = remaining.to_string().parse() {
            resp.headers_mut().insert("x-ratelimit-remaining", value);
        }
    }
    resp
}

#[allow(clippy::too_many_arguments)]
async fn serve_streaming(
    state: Arc<AppState>,
    tenant: Option<Tenant>,
    request_id: String,
    user_content: String,
    strategy: Strategy,
    classification: Classification,
    decision: RouteDecision,
    chat_req: ChatRequest,
    slot: super::rate_limit::InflightGuard,
) -> Result<Response, ApiError> {
    let chosen = decision.selected.clone();
    let provider = dispatch_provider(&state, chosen.model);

    let permit = state.breakers.can_execute(provider);
    if !permit.allowed {
        return Err(ApiError::breaker_open(provider.as_str()).with_request_id(request_id));
    }

    let adapter = state
        .providers
        .get(provider)
        .ok_or_else(|| ApiError::service_unavailable("no provider available"))?;

    let started = Instant::now();
    let outcome = match adapter.chat_stream(&chat_req).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            state.breakers.record(provider, false, elapsed_ms, e.timed_out);
            state
                .bench
                .record(chosen.model.id, elapsed_ms, false, e.timed_out);
            return Err(ApiError::provider(&e).with_request_id(request_id));
        }
    };

    let usage = outcome.usage.clone();
    let provider_status = outcome.status;
    let mut upstream = outcome.stream;
    let response_request_id = request_id.clone();
    let (tx, rx) = mpsc::channel::<Result<Vec<u8>, ProviderError>>(64);

    // Pump upstream frames to the client; on disconnect, dropping the
    // upstream stream tears down the provider connection. Accounting
    // runs once, whatever way the stream ends.
    tokio::spawn(async move {
        let mut stream_failed = false;
        while let Some(frame) = upstream.next().await {
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() {
                info!(request_id = request_id.as_str(), "client disconnected mid-stream");
                break;
            }
            if failed {
                stream_failed = true;
                break;
            }
        }
        drop(upstream);

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (input_tokens, output_tokens) = usage.map(|u| u.totals()).unwrap_or((0, 0));
        let cost = chosen.model.cost_for(input_tokens, output_tokens);
        let energy = request_energy(chosen.model, input_tokens + output_tokens);

        state
            .breakers
            .record(provider, !stream_failed, latency_ms, false);
        state
            .bench
            .record(chosen.model.id, latency_ms, !stream_failed, false);

        state.queue.enqueue_completion(log_row(
            &request_id,
            &tenant,
            &user_content,
            &classification,
            chosen.model.id,
            chosen.model.provider.as_str(),
            strategy,
            input_tokens as i64,
            output_tokens as i64,
            cost,
            energy,
            latency_ms,
            Some(provider_status as i64),
            false,
            &decision.reasoning,
        ));

        if let Some(tenant) = &tenant {
            if let Err(e) = state.tenants.record_usage(tenant, cost).await {
                warn!(error = %e, "usage update failed");
            }
        }

        state.bandit.record(
            tenant.as_ref().map(|t| t.id.as_str()),
            chosen.model.id,
            &RewardSignal {
                success: Some(!stream_failed),
                quality: None,
                latency_ms: Some(latency_ms),
                cost: Some(cost),
            },
        );

        // The request stays in-flight until its stream winds down.
        drop(slot);
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .map_err(|_| ApiError::internal(response_request_id))
}

fn preview(content: &str) -> String {
    content.chars().take(100).collect()
}

#[allow(clippy::too_many_arguments)]
fn log_row(
    request_id: &str,
    tenant: &Option<Tenant>,
    user_content: &str,
    classification: &Classification,
    model: &str,
    provider: &str,
    strategy: Strategy,
    input_tokens: i64,
    output_tokens: i64,
    cost: f64,
    energy: f64,
    latency_ms: f64,
    provider_status: Option<i64>,
    cache_hit: bool,
    reasoning: &str,
) -> RequestLogRow {
    RequestLogRow {
        request_id: request_id.to_string(),
        tenant_id: tenant.as_ref().map(|t| t.id.clone()),
        prompt_preview: preview(user_content),
        tier: classification.tier.as_str().to_string(),
        complexity_score: classification.score,
        confidence: classification.confidence,
        intent: classification.intent.as_str().to_string(),
        model: model.to_string(),
        provider: provider.to_string(),
        strategy: strategy.as_str().to_string(),
        input_tokens,
        output_tokens,
        cost,
        energy,
        latency_ms,
        provider_status,
        cache_hit,
        reasoning: reasoning.to_string(),
        created_at: Utc::now(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_strategy_precedence() {
        // Tenant default beats the request field
        let tenant = Some(Tenant {
            id: "t".to_string(),
            api_key_hash: "h".to_string(),
            name: "n".to_string(),
            strategy: Strategy::GreenFirst,
            allowed_models: None,
            budget_limit_monthly: None,
            rate_limit_rpm: 60,
            rate_limit_tpm: 100_000,
            usage_this_month: 0.0,
            created_at: Utc::now(),
        });
        assert_eq!(
            resolve_strategy(&tenant, Some("performance-first")),
            Strategy::GreenFirst
        );
        // Request field when no tenant
        assert_eq!(
            resolve_strategy(&None, Some("performance-first")),
            Strategy::PerformanceFirst
        );
        // cost-first fallback
        assert_eq!(resolve_strategy(&None, None), Strategy::CostFirst);
        assert_eq!(resolve_strategy(&None, Some("bogus")), Strategy::CostFirst);
    }

    #[test]
    fn test_effective_allowlist_merging() {
        let tenant = Some(Tenant {
            id: "t".to_string(),
            api_key_hash: "h".to_string(),
            name: "n".to_string(),
            strategy: Strategy::default(),
            allowed_models: Some(vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]),
            budget_limit_monthly: None,
            rate_limit_rpm: 60,
            rate_limit_tpm: 100_000,
            usage_this_month: 0.0,
            created_at: Utc::now(),
        });

        // Requested model inside the tenant list narrows to it
        assert_eq!(
            effective_allowlist(&tenant, Some("gpt-4o")),
            Some(vec!["gpt-4o".to_string()])
        );
        // Requested model outside the tenant list falls back to the list
        assert_eq!(
            effective_allowlist(&tenant, Some("claude-sonnet-4")),
            Some(vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()])
        );
        // Unknown model id is ignored entirely
        assert_eq!(
            effective_allowlist(&None, Some("not-a-model")),
            None
        );
        // No tenant: requested model narrows from the full catalog
        assert_eq!(
            effective_allowlist(&None, Some("command-r")),
            Some(vec!["command-r".to_string()])
        );
    }

    #[test]
    fn test_preview_truncates_at_100_chars() {
        let long = "x".repeat(250);
        assert_eq!(preview(&long).len(), 100);
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_request_energy_scales_with_tokens() {
        let model = find_model("gpt-4o").unwrap();
        assert_eq!(request_energy(model, 0), 0.0);
        assert!((request_energy(model, 1000) - model.energy_intensity).abs() < 1e-9);
    }

    #[test]
    fn test_completion_request_deserializes_minimal_body() {
        let req: CompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .unwrap();
        assert!(!req.stream);
        assert!(req.model.is_none());
        assert!(req.strategy.is_none());
    }

    #[test]
    fn test_completion_request_rejects_missing_messages() {
        let result: Result<CompletionRequest, _> = serde_json::from_value(json!({
            "model": "gpt-4o"
        }));
        assert!(result.is_err());
    }
}
