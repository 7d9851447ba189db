//! Rate limiting and concurrency control.
//!
//! Per-tenant token buckets (capacity = `rate_limit_rpm`, refilling at
//! capacity/60 per second) plus a global in-flight request cap. The
//! in-flight counter is decremented by a drop guard so it releases
//! exactly once whatever path the request takes out.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Global cap on simultaneously active completion requests.
pub const MAX_CONCURRENT_REQUESTS: usize = 100;

/// Outcome of a bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole tokens left after this request.
    pub remaining: u64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-tenant token buckets.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token from the tenant's bucket, refilling first.
    /// Refuses exactly when fewer than one token remains.
    pub fn try_acquire(&self, tenant_id: &str, rpm: u32) -> RateDecision {
        let capacity = rpm as f64;
        let mut bucket = self
            .buckets
            .entry(tenant_id.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: Instant::now(),
            });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity / 60.0).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            warn!(tenant = tenant_id, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
            };
        }
        bucket.tokens -= 1.0;
        RateDecision {
            allowed: true,
            remaining: bucket.tokens as u64,
        }
    }
}

/// Global in-flight request gauge.
#[derive(Debug)]
pub struct Inflight {
    active: AtomicUsize,
    cap: usize,
}

impl Inflight {
    pub fn new(cap: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            cap,
        }
    }

    /// Claim a slot. The returned guard releases it exactly once on
    /// drop, regardless of how the request completes.
    pub fn try_enter(self: &Arc<Self>) -> Option<InflightGuard> {
        let prev = self.active.fetch_add(1, Ordering::Relaxed);
        if prev >= self.cap {
            self.active.fetch_sub(1, Ordering::Relaxed);
            warn!(active = prev, cap = self.cap, "concurrency limit reached");
            return None;
        }
        Some(InflightGuard(Arc::clone(self)))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// RAII slot holder for the in-flight gauge.
pub struct InflightGuard(Arc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
