//! Gateway binary: wire everything, serve, shut down cleanly.

use fractal_gateway::api::{self, AppState};
use fractal_gateway::bandit::RECOMPUTE_INTERVAL;
use fractal_gateway::config::GatewayConfig;
use fractal_gateway::storage::{ModelHealthRow, Storage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Benchmarker flush cadence.
const BENCH_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fractal_gateway::init_tracing();

    let config = GatewayConfig::from_env();
    if config.mock_mode() {
        info!("no provider API keys configured, serving mock completions");
    }

    let storage = Arc::new(Storage::connect(&config.db_path).await?);
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config, storage);

    let bandit_task = spawn_bandit_recompute(Arc::clone(&state));
    let bench_task = spawn_bench_flush(Arc::clone(&state));

    let app = api::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = addr.as_str(), "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down: draining write queue");
    bandit_task.abort();
    bench_task.abort();
    state.queue.shutdown().await;
    state.storage.close().await;
    info!("shutdown complete");

    Ok(())
}

/// Rebuild the global bandit posteriors from stored feedback every
/// five minutes.
fn spawn_bandit_recompute(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECOMPUTE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick is harmless: it rebuilds from
        // whatever feedback already exists.
        loop {
            interval.tick().await;
            state.bandit.recompute(&state.storage).await;
        }
    })
}

/// Persist benchmark snapshots as model_health rows every 30 seconds.
fn spawn_bench_flush(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BENCH_FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let rows: Vec<ModelHealthRow> = state
                .bench
                .snapshot_all()
                .into_iter()
                .map(|(model, snap)| ModelHealthRow {
                    model,
                    mean_latency_ms: snap.mean_latency_ms,
                    p95_latency_ms: snap.p95_latency_ms,
                    p99_latency_ms: snap.p99_latency_ms,
                    error_rate: snap.error_rate,
                    timeout_rate: snap.timeout_rate,
                    samples: snap.samples as i64,
                    is_healthy: snap.is_healthy(),
                    created_at: chrono::Utc::now(),
                })
                .collect();
            if let Err(e) = state.storage.insert_model_health(&rows).await {
                error!(error = %e, "benchmark flush failed");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("termination signal received");
}
