//! Pipeline scenarios exercised through the library API: classifier
//! output feeding the router under live breaker state.

use fractal_gateway::breaker::{BreakerRegistry, BreakerState};
use fractal_gateway::classify::{Classifier, Intent, Tier};
use fractal_gateway::config::{Provider, Strategy, CATALOG};
use fractal_gateway::routing::{ModelRouter, RouteQuery};
use std::collections::{HashMap, HashSet};

fn route_with(
    classifier: &Classifier,
    prompt: &str,
    strategy: Strategy,
    open: &HashSet<Provider>,
) -> (fractal_gateway::routing::RouteDecision, fractal_gateway::classify::Classification) {
    let classification = classifier.classify(prompt);
    let rl = HashMap::new();
    let bench = HashMap::new();
    let query = RouteQuery {
        classification: &classification,
        strategy,
        rl_scores: &rl,
        benchmarks: &bench,
        open_providers: open,
        allowed_models: None,
    };
    let decision = ModelRouter::new().route(&query);
    (decision, classification)
}

#[test]
fn test_trivial_prompt_cost_first_picks_cheapest_model() {
    let classifier = Classifier::heuristic();
    let (decision, classification) =
        route_with(&classifier, "Hi", Strategy::CostFirst, &HashSet::new());

    assert_eq!(classification.tier, Tier::Trivial);
    assert!(classification.score <= 10.0);

    let cheapest = CATALOG
        .iter()
        .min_by(|a, b| a.avg_cost().total_cmp(&b.avg_cost()))
        .unwrap();
    assert_eq!(decision.selected.model.id, cheapest.id);
}

#[test]
fn test_mle_prompt_detects_math_intent() {
    let classifier = Classifier::heuristic();
    let c = classifier.classify(
        "Derive the asymptotic variance of the maximum-likelihood estimator \
         for a Pareto distribution",
    );
    assert!(matches!(c.intent, Intent::Math | Intent::Analysis));
}

#[test]
fn test_expert_tier_performance_first_picks_quality_90_model() {
    // The expert quality floor is what scenario cares about; feed the
    // router an expert classification directly.
    let classifier = Classifier::heuristic();
    let mut classification = classifier.classify("placeholder");
    classification.tier = Tier::Expert;
    classification.confidence = 0.9;
    classification.intent = Intent::Math;

    let rl = HashMap::new();
    let bench = HashMap::new();
    let open = HashSet::new();
    let decision = ModelRouter::new().route(&RouteQuery {
        classification: &classification,
        strategy: Strategy::PerformanceFirst,
        rl_scores: &rl,
        benchmarks: &bench,
        open_providers: &open,
        allowed_models: None,
    });

    assert!(decision.selected.model.quality_score >= 90.0);
}

#[test]
fn test_breaker_opening_reroutes_away_from_provider() {
    let classifier = Classifier::heuristic();
    let breakers = BreakerRegistry::default();

    // Find what wins with all providers healthy
    let (baseline, _) = route_with(
        &classifier,
        "Hi",
        Strategy::CostFirst,
        &breakers.open_providers(),
    );
    let favored = baseline.selected.model.provider;

    // Five consecutive non-timeout failures open the circuit
    for _ in 0..5 {
        breakers.record(favored, false, 100.0, false);
    }
    assert_eq!(breakers.state(favored), BreakerState::Open);
    let snapshot = breakers
        .snapshots()
        .into_iter()
        .find(|s| s.provider == favored)
        .unwrap();
    assert!(snapshot.last_open_reason.unwrap().contains("error rate"));

    // The same request now routes to an alternative
    let (rerouted, _) = route_with(
        &classifier,
        "Hi",
        Strategy::CostFirst,
        &breakers.open_providers(),
    );
    assert_ne!(rerouted.selected.model.provider, favored);
}

#[test]
fn test_router_is_stable_across_repeated_evaluation() {
    let classifier = Classifier::heuristic();
    let prompt = "Compare TCP and UDP protocols with use cases";
    let open = HashSet::new();
    let (first, _) = route_with(&classifier, prompt, Strategy::Balanced, &open);
    for _ in 0..10 {
        let (again, _) = route_with(&classifier, prompt, Strategy::Balanced, &open);
        assert_eq!(again.selected.model.id, first.selected.model.id);
        assert_eq!(again.selected.score, first.selected.score);
    }
}
