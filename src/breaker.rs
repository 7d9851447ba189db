//! Per-provider circuit breakers.
//!
//! Prevents cascading failures by suppressing dispatch to a failing
//! upstream and recovering via single-probe tests.
//!
//! ## States
//! - **Closed**: normal operation; every recorded outcome re-evaluates
//!   the sliding window against the open thresholds.
//! - **Open**: dispatch rejected until the cooldown elapses.
//! - **HalfOpen**: exactly one probe request is admitted; its outcome
//!   either closes the circuit or re-opens it with a doubled cooldown.

use crate::config::Provider;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker tuning. Defaults match production: a 60 s window needing 5
/// samples, opening on 50% errors, 30% timeouts, or a 30 s p95.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub min_samples: usize,
    pub error_rate_threshold: f64,
    pub timeout_rate_threshold: f64,
    pub p95_latency_threshold_ms: f64,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_samples: 5,
            error_rate_threshold: 0.5,
            timeout_rate_threshold: 0.3,
            p95_latency_threshold_ms: 30_000.0,
            base_cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(120),
        }
    }
}

/// Current state of one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of a `can_execute` check.
#[derive(Debug, Clone, PartialEq)]
pub struct Permit {
    pub allowed: bool,
    pub reason: &'static str,
}

impl Permit {
    fn allowed(reason: &'static str) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn denied(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEvent {
    at: Instant,
    success: bool,
    latency_ms: f64,
    timed_out: bool,
}

/// Serializable view of one breaker for `/health` and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: Provider,
    pub state: BreakerState,
    pub window_events: usize,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
    pub last_open_reason: Option<String>,
}

#[derive(Debug)]
struct ProviderBreaker {
    config: BreakerConfig,
    state: BreakerState,
    events: VecDeque<BreakerEvent>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    consecutive_failures: u32,
    last_open_reason: Option<String>,
    /// Set while the single HALF_OPEN probe is outstanding.
    probe_in_flight: bool,
}

impl ProviderBreaker {
    fn new(config: BreakerConfig) -> Self {
        let cooldown = config.base_cooldown;
        Self {
            config,
            state: BreakerState::Closed,
            events: VecDeque::new(),
            opened_at: None,
            cooldown,
            consecutive_failures: 0,
            last_open_reason: None,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.duration_since(front.at) > self.config.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn can_execute(&mut self, provider: Provider, now: Instant) -> Permit {
        self.prune(now);

        match self.state {
            BreakerState::Closed => Permit::allowed("closed"),
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    info!(provider = %provider, "breaker half-open, admitting probe");
                    Permit::allowed("probe")
                } else {
                    Permit::denied("circuit open")
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    Permit::denied("waiting for probe result")
                } else {
                    self.probe_in_flight = true;
                    Permit::allowed("probe")
                }
            }
        }
    }

    fn record(&mut self, provider: Provider, success: bool, latency_ms: f64, timed_out: bool) {
        let now = Instant::now();
        self.events.push_back(BreakerEvent {
            at: now,
            success,
            latency_ms,
            timed_out,
        });
        self.prune(now);

        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        match self.state {
            BreakerState::Closed => self.evaluate(provider, now),
            BreakerState::HalfOpen => {
                if success {
                    self.state = BreakerState::Closed;
                    self.cooldown = self.config.base_cooldown;
                    self.consecutive_failures = 0;
                    self.probe_in_flight = false;
                    self.events.clear();
                    info!(provider = %provider, "breaker closed after successful probe");
                } else {
                    self.reopen(provider, now, "probe failed");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Check the window against the open thresholds. Only meaningful in
    /// the Closed state with enough samples.
    fn evaluate(&mut self, provider: Provider, now: Instant) {
        if self.events.len() < self.config.min_samples {
            return;
        }

        let total = self.events.len() as f64;
        let failures = self.events.iter().filter(|e| !e.success).count() as f64;
        let timeouts = self.events.iter().filter(|e| e.timed_out).count() as f64;
        let error_rate = failures / total;
        let timeout_rate = timeouts / total;

        let mut latencies: Vec<f64> = self.events.iter().map(|e| e.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));
        let p95_idx = ((latencies.len() as f64 * 0.95).ceil() as usize).min(latencies.len() - 1);
        let p95 = latencies[p95_idx];

        let reason = if error_rate >= self.config.error_rate_threshold {
            Some(format!("error rate {:.0}%", error_rate * 100.0))
        } else if timeout_rate >= self.config.timeout_rate_threshold {
            Some(format!("timeout rate {:.0}%", timeout_rate * 100.0))
        } else if p95 >= self.config.p95_latency_threshold_ms {
            Some(format!("p95 latency {p95:.0}ms"))
        } else {
            None
        };

        if let Some(reason) = reason {
            self.open(provider, now, reason);
        }
    }

    fn open(&mut self, provider: Provider, now: Instant, reason: String) {
        warn!(provider = %provider, reason = reason.as_str(), "breaker opening");
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.last_open_reason = Some(reason);
        self.probe_in_flight = false;
    }

    fn reopen(&mut self, provider: Provider, now: Instant, reason: &str) {
        self.cooldown = (self.cooldown * 2).min(self.config.max_cooldown);
        warn!(
            provider = %provider,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "breaker re-opening: {reason}"
        );
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.last_open_reason = Some(reason.to_string());
        self.probe_in_flight = false;
    }

    fn snapshot(&mut self, provider: Provider, now: Instant) -> BreakerSnapshot {
        self.prune(now);
        BreakerSnapshot {
            provider,
            state: self.state,
            window_events: self.events.len(),
            consecutive_failures: self.consecutive_failures,
            cooldown_ms: self.cooldown.as_millis() as u64,
            last_open_reason: self.last_open_reason.clone(),
        }
    }
}

/// All provider breakers, keyed by provider. One owner: the registry is
/// shared by `Arc` and each entry mutates under its shard lock.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<Provider, ProviderBreaker>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Ask whether a request may be dispatched to `provider` right now.
    /// May transition Open → HalfOpen as a side effect.
    pub fn can_execute(&self, provider: Provider) -> Permit {
        let mut entry = self
            .breakers
            .entry(provider)
            .or_insert_with(|| ProviderBreaker::new(self.config.clone()));
        entry.can_execute(provider, Instant::now())
    }

    /// Record the outcome of a dispatched request.
    pub fn record(&self, provider: Provider, success: bool, latency_ms: f64, timed_out: bool) {
        let mut entry = self
            .breakers
            .entry(provider)
            .or_insert_with(|| ProviderBreaker::new(self.config.clone()));
        entry.record(provider, success, latency_ms, timed_out);
    }

    pub fn state(&self, provider: Provider) -> BreakerState {
        self.breakers
            .get(&provider)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Providers whose circuit is currently OPEN (HalfOpen circuits are
    /// routable: the probe goes through the normal dispatch path).
    pub fn open_providers(&self) -> std::collections::HashSet<Provider> {
        self.breakers
            .iter()
            .filter(|e| e.state == BreakerState::Open)
            .map(|e| *e.key())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        self.breakers
            .iter_mut()
            .map(|mut e| {
                let provider = *e.key();
                e.value_mut().snapshot(provider, now)
            })
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            base_cooldown: Duration::from_millis(50),
            max_cooldown: Duration::from_millis(400),
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let registry = BreakerRegistry::default();
        let permit = registry.can_execute(Provider::OpenAi);
        assert!(permit.allowed);
        assert_eq!(registry.state(Provider::OpenAi), BreakerState::Closed);
    }

    #[test]
    fn test_five_failures_open_with_error_rate_reason() {
        let registry = BreakerRegistry::default();
        for _ in 0..5 {
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        assert_eq!(registry.state(Provider::OpenAi), BreakerState::Open);
        let snaps = registry.snapshots();
        let snap = &snaps[0];
        assert!(
            snap.last_open_reason.as_deref().unwrap().contains("error rate"),
            "reason was {:?}",
            snap.last_open_reason
        );
        assert!(!registry.can_execute(Provider::OpenAi).allowed);
    }

    #[test]
    fn test_below_min_samples_never_opens() {
        let registry = BreakerRegistry::default();
        for _ in 0..4 {
            registry.record(Provider::Groq, false, 100.0, false);
        }
        assert_eq!(registry.state(Provider::Groq), BreakerState::Closed);
    }

    #[test]
    fn test_timeout_rate_opens() {
        let registry = BreakerRegistry::default();
        // 4 timeouts / 10 = 40% > 30% threshold; error rate 40% < 50%
        for _ in 0..6 {
            registry.record(Provider::Gemini, true, 100.0, false);
        }
        for _ in 0..4 {
            registry.record(Provider::Gemini, false, 100.0, true);
        }
        assert_eq!(registry.state(Provider::Gemini), BreakerState::Open);
        let snap = registry
            .snapshots()
            .into_iter()
            .find(|s| s.provider == Provider::Gemini)
            .unwrap();
        assert!(snap.last_open_reason.unwrap().contains("timeout rate"));
    }

    #[test]
    fn test_p95_latency_opens() {
        let registry = BreakerRegistry::default();
        for _ in 0..5 {
            registry.record(Provider::Cohere, true, 35_000.0, false);
        }
        assert_eq!(registry.state(Provider::Cohere), BreakerState::Open);
        let snap = registry
            .snapshots()
            .into_iter()
            .find(|s| s.provider == Provider::Cohere)
            .unwrap();
        assert!(snap.last_open_reason.unwrap().contains("p95"));
    }

    #[test]
    fn test_open_set_excludes_closed_providers() {
        let registry = BreakerRegistry::default();
        for _ in 0..5 {
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        registry.record(Provider::Anthropic, true, 100.0, false);
        let open = registry.open_providers();
        assert!(open.contains(&Provider::OpenAi));
        assert!(!open.contains(&Provider::Anthropic));
    }

    #[tokio::test]
    async fn test_probe_after_cooldown_then_close_on_success() {
        let registry = BreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        assert!(!registry.can_execute(Provider::OpenAi).allowed);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let probe = registry.can_execute(Provider::OpenAi);
        assert!(probe.allowed, "cooldown elapsed, probe must be admitted");
        assert_eq!(registry.state(Provider::OpenAi), BreakerState::HalfOpen);

        // A second caller while the probe is outstanding is rejected
        let second = registry.can_execute(Provider::OpenAi);
        assert!(!second.allowed);
        assert_eq!(second.reason, "waiting for probe result");

        registry.record(Provider::OpenAi, true, 100.0, false);
        assert_eq!(registry.state(Provider::OpenAi), BreakerState::Closed);
        assert!(registry.can_execute(Provider::OpenAi).allowed);
    }

    #[tokio::test]
    async fn test_failed_probe_doubles_cooldown() {
        let registry = BreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.can_execute(Provider::OpenAi).allowed);

        registry.record(Provider::OpenAi, false, 100.0, false);
        assert_eq!(registry.state(Provider::OpenAi), BreakerState::Open);
        let snaps = registry.snapshots();
        let snap = &snaps[0];
        assert_eq!(snap.cooldown_ms, 100, "cooldown must double from 50ms");

        // Not yet recovered after the original cooldown
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!registry.can_execute(Provider::OpenAi).allowed);
    }

    #[tokio::test]
    async fn test_cooldown_caps_at_max() {
        let registry = BreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(450)).await;
            assert!(registry.can_execute(Provider::OpenAi).allowed);
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        let snaps = registry.snapshots();
        let snap = &snaps[0];
        assert_eq!(snap.cooldown_ms, 400, "cooldown must cap at max");
    }

    #[tokio::test]
    async fn test_successful_probe_resets_cooldown_to_base() {
        let registry = BreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.record(Provider::OpenAi, false, 100.0, false);
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.can_execute(Provider::OpenAi).allowed);
        registry.record(Provider::OpenAi, false, 100.0, false); // doubled to 100

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.can_execute(Provider::OpenAi).allowed);
        registry.record(Provider::OpenAi, true, 100.0, false);

        let snaps = registry.snapshots();
        let snap = &snaps[0];
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.cooldown_ms, 50, "success must reset cooldown to base");
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let registry = BreakerRegistry::default();
        registry.record(Provider::OpenAi, false, 100.0, false);
        registry.record(Provider::OpenAi, false, 100.0, false);
        registry.record(Provider::OpenAi, true, 100.0, false);
        let snaps = registry.snapshots();
        let snap = &snaps[0];
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn test_mixed_traffic_below_thresholds_stays_closed() {
        let registry = BreakerRegistry::default();
        for i in 0..20 {
            registry.record(Provider::OpenAi, i % 4 != 0, 500.0, false);
        }
        // 25% errors, no timeouts, fast p95 → closed
        assert_eq!(registry.state(Provider::OpenAi), BreakerState::Closed);
    }
}
