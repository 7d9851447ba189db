//! Multi-factor weighted model selection.
//!
//! Scoring runs in four phases:
//!
//! | Phase | What happens |
//! |-----------|---------------------------------------------------------|
//! | Filter    | tenant allowlist, OPEN-circuit exclusion, tier minimum quality (+15 when classifier confidence is low) |
//! | Normalize | min-max over survivors for cost, latency, energy; lower-is-better axes are inverted |
//! | Blend     | observed latency/reliability mixed with catalog baselines by `min(samples/20, 1)` |
//! | Score     | weighted sum of the six axes, rounded to 3 decimals; descending stable sort |
//!
//! The router is deterministic: identical inputs produce identical
//! decisions, and ties break toward catalog insertion order.

use crate::bench::BenchSnapshot;
use crate::classify::{Classification, Tier};
use crate::config::{ModelEntry, Provider, Strategy, StrategyWeights, CATALOG};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Minimum catalog quality admitted per complexity tier.
fn tier_min_quality(tier: Tier) -> f64 {
    match tier {
        Tier::Trivial | Tier::Simple => 0.0,
        Tier::Moderate => 60.0,
        Tier::Complex => 80.0,
        Tier::Expert => 90.0,
    }
}

/// Classifier confidence below which the quality floor is raised.
const LOW_CONFIDENCE: f64 = 0.5;
const LOW_CONFIDENCE_QUALITY_BUMP: f64 = 15.0;
const QUALITY_CEILING: f64 = 95.0;

/// Benchmark sample count at which observations fully replace baselines.
const BLEND_SATURATION: f64 = 20.0;

/// Neutral bandit score for models with no posterior yet.
const NEUTRAL_RL_SCORE: f64 = 0.5;

/// Per-axis component scores for one candidate, all in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub cost: f64,
    pub quality: f64,
    pub latency: f64,
    pub energy: f64,
    pub reliability: f64,
    pub rl: f64,
}

/// A scored candidate model.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredModel {
    pub model: &'static ModelEntry,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// The routing outcome: a primary selection plus the full ordered
/// candidate list for fallback.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub selected: ScoredModel,
    /// All scored candidates, best first. `candidates[0] == selected`.
    pub candidates: Vec<ScoredModel>,
    pub weights: StrategyWeights,
    pub reasoning: String,
}

/// Inputs to one routing decision.
pub struct RouteQuery<'a> {
    pub classification: &'a Classification,
    pub strategy: Strategy,
    /// Bandit scores keyed by model id; missing models score neutral.
    pub rl_scores: &'a HashMap<String, f64>,
    /// Live benchmark snapshots keyed by model id.
    pub benchmarks: &'a HashMap<String, BenchSnapshot>,
    /// Providers whose circuit is currently OPEN.
    pub open_providers: &'a HashSet<Provider>,
    /// Tenant allowlist; `None` admits every model.
    pub allowed_models: Option<&'a [String]>,
}

/// Stateless router over the static catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelRouter;

impl ModelRouter {
    pub fn new() -> Self {
        Self
    }

    /// Score every viable model and select the best.
    pub fn route(&self, query: &RouteQuery<'_>) -> RouteDecision {
        let candidates = self.filter_candidates(query);
        let scored = self.score_candidates(&candidates, query);

        // Stable sort: equal scores keep catalog insertion order.
        let mut ordered = scored;
        ordered.sort_by(|a, b| b.score.total_cmp(&a.score));

        let selected = ordered[0].clone();
        let reasoning = reasoning_for(&selected, query);

        RouteDecision {
            selected,
            candidates: ordered,
            weights: query.strategy.weights(),
            reasoning,
        }
    }

    /// Apply the filter chain. The result is never empty: if every filter
    /// empties the set, the full catalog is reinstated.
    fn filter_candidates(&self, query: &RouteQuery<'_>) -> Vec<&'static ModelEntry> {
        let allowed: Vec<&'static ModelEntry> = CATALOG
            .iter()
            .filter(|m| match query.allowed_models {
                Some(list) => list.iter().any(|id| id == m.id),
                None => true,
            })
            .collect();

        let healthy: Vec<&'static ModelEntry> = allowed
            .iter()
            .copied()
            .filter(|m| !query.open_providers.contains(&m.provider))
            .collect();

        let min_quality = tier_min_quality(query.classification.tier);
        let quality_filtered: Vec<&'static ModelEntry> = healthy
            .iter()
            .copied()
            .filter(|m| m.quality_score >= min_quality)
            .collect();

        // Quality filtering may not empty the set; fall back to the
        // pre-filter candidates when it does.
        let mut current = if quality_filtered.is_empty() {
            healthy
        } else {
            quality_filtered
        };

        // Low classifier confidence: prefer a safer (higher-quality)
        // subset, but only when one exists.
        if query.classification.confidence < LOW_CONFIDENCE {
            let raised = (min_quality + LOW_CONFIDENCE_QUALITY_BUMP).min(QUALITY_CEILING);
            let safer: Vec<&'static ModelEntry> = current
                .iter()
                .copied()
                .filter(|m| m.quality_score >= raised)
                .collect();
            if !safer.is_empty() {
                current = safer;
            }
        }

        if current.is_empty() {
            warn!(
                tier = %query.classification.tier,
                "all candidates filtered out, reinstating full catalog"
            );
            current = CATALOG.iter().collect();
        }

        current
    }

    fn score_candidates(
        &self,
        candidates: &[&'static ModelEntry],
        query: &RouteQuery<'_>,
    ) -> Vec<ScoredModel> {
        let weights = query.strategy.weights();

        // Blend latency with observations first so normalization sees the
        // effective values the dispatch will actually experience.
        let latencies: Vec<f64> = candidates
            .iter()
            .map(|m| self.blended_latency(m, query.benchmarks.get(m.id)))
            .collect();
        let costs: Vec<f64> = candidates.iter().map(|m| m.avg_cost()).collect();
        let energies: Vec<f64> = candidates.iter().map(|m| m.energy_intensity).collect();

        let cost_range = min_max(&costs);
        let latency_range = min_max(&latencies);
        let energy_range = min_max(&energies);

        candidates
            .iter()
            .enumerate()
            .map(|(i, &model)| {
                let breakdown = ScoreBreakdown {
                    cost: inverted(costs[i], cost_range),
                    quality: self.quality_match(model, query.classification),
                    latency: inverted(latencies[i], latency_range),
                    energy: inverted(energies[i], energy_range),
                    reliability: self.blended_reliability(model, query.benchmarks.get(model.id)),
                    rl: query
                        .rl_scores
                        .get(model.id)
                        .copied()
                        .unwrap_or(NEUTRAL_RL_SCORE),
                };

                let raw = weights.cost * breakdown.cost
                    + weights.quality * breakdown.quality
                    + weights.latency * breakdown.latency
                    + weights.energy * breakdown.energy
                    + weights.reliability * breakdown.reliability
                    + weights.rl * breakdown.rl;

                ScoredModel {
                    model,
                    score: (raw * 1000.0).round() / 1000.0,
                    breakdown,
                }
            })
            .collect()
    }

    /// `min(1, quality/100 + 0.2 * matched_fraction)` where the fraction
    /// is over the intent's required strengths.
    fn quality_match(&self, model: &ModelEntry, classification: &Classification) -> f64 {
        let required = classification.intent.required_strengths();
        let bonus = if required.is_empty() {
            0.0
        } else {
            let matches = required
                .iter()
                .filter(|s| model.strengths.contains(s))
                .count();
            0.2 * matches as f64 / required.len() as f64
        };
        (model.quality_score / 100.0 + bonus).min(1.0)
    }

    fn blended_latency(&self, model: &ModelEntry, snap: Option<&BenchSnapshot>) -> f64 {
        match snap {
            Some(s) if s.samples > 0 => {
                let blend = (s.samples as f64 / BLEND_SATURATION).min(1.0);
                s.mean_latency_ms * blend + model.avg_latency_ms * (1.0 - blend)
            }
            _ => model.avg_latency_ms,
        }
    }

    fn blended_reliability(&self, model: &ModelEntry, snap: Option<&BenchSnapshot>) -> f64 {
        match snap {
            Some(s) if s.samples > 0 => {
                let blend = (s.samples as f64 / BLEND_SATURATION).min(1.0);
                (1.0 - s.error_rate) * blend + model.reliability * (1.0 - blend)
            }
            _ => model.reliability,
        }
    }
}

/// Min-max normalize, then invert so lower raw values score higher.
/// A degenerate range (max == min) scores 0.5 for everyone.
fn inverted(value: f64, (min, max): (f64, f64)) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        0.5
    } else {
        1.0 - (value - min) / (max - min)
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

fn reasoning_for(selected: &ScoredModel, query: &RouteQuery<'_>) -> String {
    let b = &selected.breakdown;
    format!(
        "{} ({}) via {} for {} tier / {} intent: score {:.3} \
         [cost {:.2}, quality {:.2}, latency {:.2}, energy {:.2}, reliability {:.2}, rl {:.2}]",
        selected.model.id,
        selected.model.provider,
        query.strategy,
        query.classification.tier,
        query.classification.intent,
        selected.score,
        b.cost,
        b.quality,
        b.latency,
        b.energy,
        b.reliability,
        b.rl,
    )
}

// ── Tests ──────────────────────────────────────────────────────────────
