//! Passive benchmarker.
//!
//! Tracks rolling latency and error observations per model from live
//! traffic, with no synthetic probe requests. The router blends these
//! observations with the catalog baselines; a background task flushes
//! snapshots to the `model_health` table every 30 seconds.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Observations retained per model.
const WINDOW: usize = 100;

/// Point-in-time rollup of one model's recent traffic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchSnapshot {
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Failures / total observations, in `[0, 1]`.
    pub error_rate: f64,
    /// Timeouts / total observations, in `[0, 1]`.
    pub timeout_rate: f64,
    pub samples: u64,
}

impl BenchSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.error_rate < 0.5
    }
}

#[derive(Debug, Default)]
struct ModelWindow {
    latencies: VecDeque<f64>,
    successes: u64,
    failures: u64,
    timeouts: u64,
}

impl ModelWindow {
    fn record(&mut self, latency_ms: f64, success: bool, timed_out: bool) {
        self.latencies.push_back(latency_ms);
        while self.latencies.len() > WINDOW {
            self.latencies.pop_front();
        }
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if timed_out {
            self.timeouts += 1;
        }
    }

    fn snapshot(&self) -> BenchSnapshot {
        let total = self.successes + self.failures;
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        BenchSnapshot {
            mean_latency_ms: mean,
            p50_latency_ms: percentile_floor(&sorted, 0.50),
            p95_latency_ms: percentile_ceil(&sorted, 0.95),
            p99_latency_ms: percentile_ceil(&sorted, 0.99),
            error_rate: rate(self.failures, total),
            timeout_rate: rate(self.timeouts, total),
            samples: total,
        }
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn percentile_floor(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Ceil-index convention for the high percentiles, falling back to the
/// upper bound when the index overruns.
fn percentile_ceil(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q).ceil() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Rolling per-model traffic statistics. Clone is cheap; clones share
/// state through the interior mutex.
#[derive(Debug, Default)]
pub struct Benchmarker {
    windows: Mutex<HashMap<String, ModelWindow>>,
}

impl Benchmarker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed (or failed) upstream call.
    pub fn record(&self, model: &str, latency_ms: f64, success: bool, timed_out: bool) {
        let mut windows = match self.windows.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        windows
            .entry(model.to_string())
            .or_default()
            .record(latency_ms, success, timed_out);
    }

    pub fn snapshot(&self, model: &str) -> Option<BenchSnapshot> {
        self.windows
            .lock()
            .ok()
            .and_then(|w| w.get(model).map(ModelWindow::snapshot))
    }

    /// Snapshots for every model that has seen traffic.
    pub fn snapshot_all(&self) -> HashMap<String, BenchSnapshot> {
        match self.windows.lock() {
            Ok(w) => w.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect(),
            Err(_) => HashMap::new(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_model_has_no_snapshot() {
        let bench = Benchmarker::new();
        assert!(bench.snapshot("gpt-4o").is_none());
    }

    #[test]
    fn test_single_observation() {
        let bench = Benchmarker::new();
        bench.record("m", 200.0, true, false);
        let snap = bench.snapshot("m").unwrap();
        assert_eq!(snap.samples, 1);
        assert_eq!(snap.mean_latency_ms, 200.0);
        assert_eq!(snap.p95_latency_ms, 200.0);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[test]
    fn test_error_and_timeout_rates() {
        let bench = Benchmarker::new();
        for _ in 0..6 {
            bench.record("m", 100.0, true, false);
        }
        for _ in 0..3 {
            bench.record("m", 100.0, false, false);
        }
        bench.record("m", 100.0, false, true);
        let snap = bench.snapshot("m").unwrap();
        assert_eq!(snap.samples, 10);
        assert!((snap.error_rate - 0.4).abs() < 1e-9);
        assert!((snap.timeout_rate - 0.1).abs() < 1e-9);
        assert!(snap.is_healthy());
    }

    #[test]
    fn test_unhealthy_above_half_errors() {
        let bench = Benchmarker::new();
        for _ in 0..5 {
            bench.record("m", 100.0, false, false);
        }
        for _ in 0..5 {
            bench.record("m", 100.0, true, false);
        }
        assert!(!bench.snapshot("m").unwrap().is_healthy());
    }

    #[test]
    fn test_latency_window_caps_at_100() {
        let bench = Benchmarker::new();
        for i in 0..150 {
            bench.record("m", i as f64, true, false);
        }
        let snap = bench.snapshot("m").unwrap();
        // Counters keep full history; the latency buffer holds the last 100
        assert_eq!(snap.samples, 150);
        // Oldest latencies (0..50) were evicted, so p50 reflects 50..150
        assert!(snap.p50_latency_ms >= 50.0);
    }

    #[test]
    fn test_percentiles_on_known_distribution() {
        let bench = Benchmarker::new();
        for i in 1..=100 {
            bench.record("m", i as f64, true, false);
        }
        let snap = bench.snapshot("m").unwrap();
        assert!((snap.mean_latency_ms - 50.5).abs() < 1e-9);
        // ceil-index: p95 of 1..=100 is the 96th value
        assert_eq!(snap.p95_latency_ms, 96.0);
        assert_eq!(snap.p99_latency_ms, 100.0);
    }

    #[test]
    fn test_percentile_ceil_upper_bound_fallback() {
        let sorted = [10.0, 20.0];
        // ceil(2 * 0.99) = 2 overruns → clamp to last element
        assert_eq!(percentile_ceil(&sorted, 0.99), 20.0);
    }

    #[test]
    fn test_snapshot_all_covers_every_model() {
        let bench = Benchmarker::new();
        bench.record("a", 10.0, true, false);
        bench.record("b", 20.0, false, true);
        let all = bench.snapshot_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"].timeout_rate, 1.0);
    }
}
