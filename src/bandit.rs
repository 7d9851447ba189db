//! Thompson-sampling bandit over the model catalog.
//!
//! Keeps a Beta(α, β) posterior per `(scope, model)` pair, where scope is
//! a tenant id or the shared global scope. Sampling uses the cheap
//! normal approximation around the Beta mean (Box–Muller noise); an
//! exploration floor keeps every model's score strictly positive so no
//! arm is ever starved.
//!
//! Posteriors live in memory only. A background task rebuilds the global
//! scope from stored feedback every five minutes; tenant scopes keep
//! their in-memory state across recomputes.

use crate::config::CATALOG;
use crate::storage::{FeedbackRow, Storage};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Posterior window: α + β is clamped here by proportional rescaling so
/// old evidence decays.
const WINDOW: f64 = 200.0;
const LEARNING_RATE: f64 = 0.1;
const EXPLORATION_FLOOR: f64 = 0.05;

/// How often the global posteriors are rebuilt from storage.
pub const RECOMPUTE_INTERVAL: Duration = Duration::from_secs(300);
/// Feedback rows consulted per model during a recompute.
const RECOMPUTE_ROWS: u32 = 200;

/// Reward factor weights. Absent factors contribute a neutral 0.5.
const W_SUCCESS: f64 = 0.4;
const W_QUALITY: f64 = 0.3;
const W_LATENCY: f64 = 0.2;
const W_COST: f64 = 0.1;

const LATENCY_CEILING_MS: f64 = 30_000.0;
const COST_CEILING: f64 = 0.01;

/// One reward observation.
#[derive(Debug, Clone, Default)]
pub struct RewardSignal {
    pub success: Option<bool>,
    /// Explicit quality feedback on a 0–10 scale.
    pub quality: Option<f64>,
    pub latency_ms: Option<f64>,
    pub cost: Option<f64>,
}

impl RewardSignal {
    /// Collapse the signal to a scalar reward in `[0, 1]`.
    pub fn reward(&self) -> f64 {
        let factor = |value: Option<f64>| value.unwrap_or(0.5).clamp(0.0, 1.0);
        let success = factor(self.success.map(|s| if s { 1.0 } else { 0.0 }));
        let quality = factor(self.quality.map(|q| q / 10.0));
        let latency = factor(self.latency_ms.map(|l| 1.0 - l / LATENCY_CEILING_MS));
        let cost = factor(self.cost.map(|c| 1.0 - c / COST_CEILING));

        W_SUCCESS * success + W_QUALITY * quality + W_LATENCY * latency + W_COST * cost
    }
}

/// Beta posterior with a clamped evidence window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posterior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for Posterior {
    fn default() -> Self {
        // Uniform prior
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

impl Posterior {
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    fn std(&self) -> f64 {
        let n = self.alpha + self.beta;
        (self.alpha * self.beta / (n * n * (n + 1.0))).sqrt()
    }

    /// Apply one reward observation, rescaling when the evidence window
    /// overflows.
    pub fn update(&mut self, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        self.alpha += LEARNING_RATE * reward;
        self.beta += LEARNING_RATE * (1.0 - reward);

        let total = self.alpha + self.beta;
        if total > WINDOW {
            let scale = WINDOW / total;
            self.alpha *= scale;
            self.beta *= scale;
        }
    }

    /// Draw an approximate Beta sample: `mean + z·std` clamped to
    /// `[0, 1]`, with `z` from Box–Muller.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        (self.mean() + z * self.std()).clamp(0.0, 1.0)
    }
}

type PosteriorMap = HashMap<String, Posterior>;

/// The bandit engine. One owner: shared by `Arc`, mutated under the two
/// interior mutexes (tenant scopes and the global scope are disjoint).
#[derive(Debug, Default)]
pub struct BanditEngine {
    tenants: Mutex<HashMap<String, PosteriorMap>>,
    global: Mutex<PosteriorMap>,
}

impl BanditEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampled scores for every catalog model under the given scope,
    /// with the exploration floor applied after sampling.
    pub fn scores(&self, tenant_id: Option<&str>) -> HashMap<String, f64> {
        let mut rng = rand::thread_rng();
        let mut out = HashMap::with_capacity(CATALOG.len());

        match tenant_id {
            Some(tenant) => {
                let mut tenants = match self.tenants.lock() {
                    Ok(g) => g,
                    Err(_) => return out,
                };
                let scope = tenants.entry(tenant.to_string()).or_default();
                for model in CATALOG {
                    let posterior = scope.entry(model.id.to_string()).or_default();
                    out.insert(
                        model.id.to_string(),
                        posterior.sample(&mut rng).max(EXPLORATION_FLOOR),
                    );
                }
            }
            None => {
                let mut global = match self.global.lock() {
                    Ok(g) => g,
                    Err(_) => return out,
                };
                for model in CATALOG {
                    let posterior = global.entry(model.id.to_string()).or_default();
                    out.insert(
                        model.id.to_string(),
                        posterior.sample(&mut rng).max(EXPLORATION_FLOOR),
                    );
                }
            }
        }
        out
    }

    /// Record feedback for a model, updating the tenant scope (when
    /// present) and the global scope.
    pub fn record(&self, tenant_id: Option<&str>, model_id: &str, signal: &RewardSignal) {
        let reward = signal.reward();

        if let Some(tenant) = tenant_id {
            if let Ok(mut tenants) = self.tenants.lock() {
                tenants
                    .entry(tenant.to_string())
                    .or_default()
                    .entry(model_id.to_string())
                    .or_default()
                    .update(reward);
            }
        }
        if let Ok(mut global) = self.global.lock() {
            global
                .entry(model_id.to_string())
                .or_default()
                .update(reward);
        }
        debug!(model = model_id, reward, "bandit feedback recorded");
    }

    /// Posterior mean for one model in the global scope (for stats).
    pub fn global_mean(&self, model_id: &str) -> f64 {
        self.global
            .lock()
            .ok()
            .and_then(|g| g.get(model_id).map(Posterior::mean))
            .unwrap_or(0.5)
    }

    /// Rebuild the global posteriors from stored feedback. Tenant
    /// posteriors keep their in-memory state; recompute applies to the
    /// global scope only.
    pub async fn recompute(&self, storage: &Storage) {
        let mut rebuilt: PosteriorMap = HashMap::new();

        for model in CATALOG {
            let rows: Vec<FeedbackRow> = match storage
                .recent_feedback_for_model(model.id, RECOMPUTE_ROWS)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(model = model.id, error = %e, "bandit recompute read failed");
                    continue;
                }
            };

            let mut posterior = Posterior::default();
            for row in rows.iter().rev() {
                let signal = RewardSignal {
                    success: Some(row.success),
                    quality: row.quality,
                    latency_ms: row.latency_ms,
                    cost: row.cost,
                };
                posterior.update(signal.reward());
            }
            rebuilt.insert(model.id.to_string(), posterior);
        }

        if let Ok(mut global) = self.global.lock() {
            *global = rebuilt;
        }
        debug!("bandit global posteriors recomputed");
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_posterior_is_uniform_prior() {
        let p = Posterior::default();
        assert_eq!(p.alpha, 1.0);
        assert_eq!(p.beta, 1.0);
        assert_eq!(p.mean(), 0.5);
    }

    #[test]
    fn test_update_keeps_parameters_positive_and_windowed() {
        let mut p = Posterior::default();
        for _ in 0..10_000 {
            p.update(1.0);
        }
        assert!(p.alpha > 0.0 && p.beta > 0.0);
        assert!(p.alpha + p.beta <= WINDOW + 1e-9);
    }

    #[test]
    fn test_posterior_mean_monotonic_under_positive_feedback() {
        let mut p = Posterior::default();
        let mut last = p.mean();
        for _ in 0..50 {
            p.update(1.0);
            let mean = p.mean();
            assert!(mean >= last, "mean must not decrease under reward 1.0");
            last = mean;
        }
        assert!(last > 0.5);
    }

    #[test]
    fn test_posterior_mean_decreases_under_negative_feedback() {
        let mut p = Posterior::default();
        for _ in 0..50 {
            p.update(0.0);
        }
        assert!(p.mean() < 0.5);
    }

    #[test]
    fn test_sample_stays_in_unit_interval() {
        let mut p = Posterior::default();
        for _ in 0..200 {
            p.update(0.9);
        }
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let s = p.sample(&mut rng);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_reward_all_factors_present() {
        let signal = RewardSignal {
            success: Some(true),
            quality: Some(8.0),
            latency_ms: Some(3000.0),
            cost: Some(0.002),
        };
        // 0.4*1 + 0.3*0.8 + 0.2*(1-0.1) + 0.1*(1-0.2) = 0.4+0.24+0.18+0.08
        assert!((signal.reward() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_reward_absent_factors_are_neutral() {
        let signal = RewardSignal::default();
        // All four neutral: 0.5 * (0.4+0.3+0.2+0.1)
        assert!((signal.reward() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_reward_clamps_extreme_factors() {
        let signal = RewardSignal {
            success: Some(false),
            quality: Some(15.0),     // above scale → clamp to 1.0
            latency_ms: Some(90_000.0), // beyond ceiling → clamp to 0.0
            cost: Some(1.0),         // beyond ceiling → clamp to 0.0
        };
        assert!((signal.reward() - 0.3).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&signal.reward()));
    }

    #[test]
    fn test_scores_cover_catalog_with_floor() {
        let engine = BanditEngine::new();
        let scores = engine.scores(None);
        assert_eq!(scores.len(), CATALOG.len());
        for (model, score) in &scores {
            assert!(
                *score >= EXPLORATION_FLOOR,
                "{model} below exploration floor: {score}"
            );
            assert!(*score <= 1.0);
        }
    }

    #[test]
    fn test_record_updates_both_scopes() {
        let engine = BanditEngine::new();
        let signal = RewardSignal {
            success: Some(true),
            ..RewardSignal::default()
        };
        for _ in 0..100 {
            engine.record(Some("tenant-1"), "gpt-4o", &signal);
        }
        assert!(engine.global_mean("gpt-4o") > 0.5);

        let tenants = engine.tenants.lock().unwrap();
        let posterior = tenants["tenant-1"]["gpt-4o"];
        assert!(posterior.mean() > 0.5);
    }

    #[test]
    fn test_tenant_scopes_are_isolated() {
        let engine = BanditEngine::new();
        let bad = RewardSignal {
            success: Some(false),
            ..RewardSignal::default()
        };
        for _ in 0..100 {
            engine.record(Some("unlucky"), "gpt-4o", &bad);
        }
        let tenants = engine.tenants.lock().unwrap();
        assert!(tenants["unlucky"]["gpt-4o"].mean() < 0.5);
        assert!(!tenants.contains_key("lucky"));
    }

    #[tokio::test]
    async fn test_recompute_rebuilds_global_but_not_tenant_state() {
        let storage = Storage::in_memory().await.unwrap();
        let engine = BanditEngine::new();

        // Seed in-memory state in both scopes
        let good = RewardSignal {
            success: Some(true),
            ..RewardSignal::default()
        };
        for _ in 0..100 {
            engine.record(Some("t1"), "gpt-4o", &good);
        }
        let tenant_mean_before = {
            let tenants = engine.tenants.lock().unwrap();
            tenants["t1"]["gpt-4o"].mean()
        };
        assert!(engine.global_mean("gpt-4o") > 0.5);

        // No stored feedback → global resets to the prior
        engine.recompute(&storage).await;
        assert!((engine.global_mean("gpt-4o") - 0.5).abs() < 1e-9);

        let tenants = engine.tenants.lock().unwrap();
        assert!((tenants["t1"]["gpt-4o"].mean() - tenant_mean_before).abs() < 1e-12);
    }
}
