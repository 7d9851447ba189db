//! Gated semantic response cache.
//!
//! Exact-hash matching always runs; embedding similarity is a second
//! tier that only activates once the cache holds enough entries, and
//! disables itself when the overall hit rate stays poor. Entries expire
//! by TTL (pruned lazily on lookup) and are evicted in LRU order when
//! the cache is full.
//!
//! Cache failures never fail a request: every public operation degrades
//! to a miss.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub similarity_threshold: f64,
    /// Embedding matching stays off until this many entries exist.
    pub min_entries_for_embeddings: usize,
    /// After this many lookups, a poor hit rate disables embeddings.
    pub autodisable_min_lookups: u64,
    pub autodisable_hit_rate: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
            similarity_threshold: 0.92,
            min_entries_for_embeddings: 100,
            autodisable_min_lookups: 50,
            autodisable_hit_rate: 0.15,
        }
    }
}

/// Where a cache hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Exact,
    Semantic,
}

/// Result of a lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub hit: bool,
    pub response: Option<serde_json::Value>,
    pub model: Option<String>,
    pub source: Option<CacheSource>,
}

impl CacheLookup {
    fn miss() -> Self {
        Self {
            hit: false,
            response: None,
            model: None,
            source: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ExactEntry {
    response: serde_json::Value,
    model: String,
    stored_at: Instant,
    hit_count: u64,
}

#[derive(Debug, Clone)]
struct EmbeddingEntry {
    hash: String,
    embedding: Vec<f64>,
    response: serde_json::Value,
    model: String,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    exact: HashMap<String, ExactEntry>,
    embeddings: Vec<EmbeddingEntry>,
    /// LRU order, least recent first. Touched hashes move to the back.
    lru: VecDeque<String>,
}

impl CacheInner {
    fn touch(&mut self, hash: &str) {
        if let Some(pos) = self.lru.iter().position(|h| h == hash) {
            self.lru.remove(pos);
        }
        self.lru.push_back(hash.to_string());
    }

    fn remove(&mut self, hash: &str) {
        self.exact.remove(hash);
        self.embeddings.retain(|e| e.hash != hash);
        if let Some(pos) = self.lru.iter().position(|h| h == hash) {
            self.lru.remove(pos);
        }
    }
}

/// Aggregate cache counters for `/api/stats`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub embeddings_enabled: bool,
}

/// Bounded in-memory semantic cache.
pub struct SemanticCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    embeddings_disabled: AtomicBool,
}

impl SemanticCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            exact_hits: AtomicU64::new(0),
            semantic_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            embeddings_disabled: AtomicBool::new(false),
        }
    }

    /// Look up by prompt hash, optionally with an embedding vector for
    /// similarity matching. The embedding path is a no-op until the gate
    /// conditions are met.
    pub fn lookup(&self, hash: &str, embedding: Option<&[f64]>) -> CacheLookup {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return CacheLookup::miss(),
        };
        let now = Instant::now();

        // Expired exact entries are evicted lazily, never returned.
        let mut expired = false;
        if let Some(entry) = inner.exact.get_mut(hash) {
            if now.duration_since(entry.stored_at) >= self.config.ttl {
                expired = true;
            } else {
                entry.hit_count += 1;
                let response = entry.response.clone();
                let model = entry.model.clone();
                inner.touch(hash);
                drop(inner);
                self.exact_hits.fetch_add(1, Ordering::Relaxed);
                debug!(hash, "cache hit (exact)");
                return CacheLookup {
                    hit: true,
                    response: Some(response),
                    model: Some(model),
                    source: Some(CacheSource::Exact),
                };
            }
        }
        if expired {
            inner.remove(hash);
        }

        if let Some(query) = embedding {
            if self.embeddings_active(inner.exact.len()) {
                let mut best: Option<(f64, usize)> = None;
                for (i, entry) in inner.embeddings.iter().enumerate() {
                    if now.duration_since(entry.stored_at) >= self.config.ttl {
                        continue;
                    }
                    let sim = cosine_similarity(query, &entry.embedding);
                    if sim >= self.config.similarity_threshold
                        && best.map(|(b, _)| sim > b).unwrap_or(true)
                    {
                        best = Some((sim, i));
                    }
                }
                if let Some((sim, idx)) = best {
                    let entry = inner.embeddings[idx].clone();
                    inner.touch(&entry.hash);
                    drop(inner);
                    self.semantic_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(hash = entry.hash.as_str(), similarity = sim, "cache hit (semantic)");
                    self.maybe_autodisable();
                    return CacheLookup {
                        hit: true,
                        response: Some(entry.response),
                        model: Some(entry.model),
                        source: Some(CacheSource::Semantic),
                    };
                }
            }
        }

        drop(inner);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.maybe_autodisable();
        CacheLookup::miss()
    }

    /// Store a response, evicting LRU entries until under capacity.
    pub fn store(
        &self,
        hash: &str,
        response: serde_json::Value,
        model: &str,
        embedding: Option<Vec<f64>>,
    ) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };

        while inner.exact.len() >= self.config.max_entries {
            match inner.lru.front().cloned() {
                Some(oldest) => inner.remove(&oldest),
                None => break,
            }
        }

        let now = Instant::now();
        inner.exact.insert(
            hash.to_string(),
            ExactEntry {
                response: response.clone(),
                model: model.to_string(),
                stored_at: now,
                hit_count: 0,
            },
        );
        if let Some(embedding) = embedding {
            inner.embeddings.push(EmbeddingEntry {
                hash: hash.to_string(),
                embedding,
                response,
                model: model.to_string(),
                stored_at: now,
            });
        }
        inner.touch(hash);
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.lock().map(|g| g.exact.len()).unwrap_or(0);
        let exact = self.exact_hits.load(Ordering::Relaxed);
        let semantic = self.semantic_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            entries,
            exact_hits: exact,
            semantic_hits: semantic,
            misses,
            hit_rate: self.hit_rate(),
            embeddings_enabled: !self.embeddings_disabled.load(Ordering::Relaxed),
        }
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.exact_hits.load(Ordering::Relaxed) + self.semantic_hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn lookups(&self) -> u64 {
        self.exact_hits.load(Ordering::Relaxed)
            + self.semantic_hits.load(Ordering::Relaxed)
            + self.misses.load(Ordering::Relaxed)
    }

    fn embeddings_active(&self, entries: usize) -> bool {
        !self.embeddings_disabled.load(Ordering::Relaxed)
            && entries >= self.config.min_entries_for_embeddings
    }

    /// Disable embedding scans permanently once the hit rate proves poor.
    fn maybe_autodisable(&self) {
        if self.embeddings_disabled.load(Ordering::Relaxed) {
            return;
        }
        if self.lookups() >= self.config.autodisable_min_lookups
            && self.hit_rate() < self.config.autodisable_hit_rate
        {
            info!(
                hit_rate = self.hit_rate(),
                "semantic cache hit rate too low, disabling embedding matching"
            );
            self.embeddings_disabled.store(true, Ordering::Relaxed);
        }
    }
}

impl Default for SemanticCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched or empty input.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f64 = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if mag_a < 1e-9 || mag_b < 1e-9 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

// ── Tests ──────────────────────────────────────────────────────────────
