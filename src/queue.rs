//! Batched asynchronous log writes.
//!
//! Request log rows are enqueued off the hot path and flushed to storage
//! in one transaction per tick. When the backlog exceeds the degraded
//! threshold, non-critical rows (cache hits) are shed until the backlog
//! halves; completion rows are always accepted while the channel has
//! room. Shutdown flushes synchronously.

use crate::storage::{RequestLogRow, Storage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub flush_interval: Duration,
    /// Backlog depth that triggers degraded mode.
    pub degraded_threshold: usize,
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            degraded_threshold: 1000,
            channel_capacity: 4096,
        }
    }
}

/// Handle to the background write queue. Cheap to clone via `Arc`.
pub struct LogQueue {
    tx: mpsc::Sender<RequestLogRow>,
    depth: Arc<AtomicUsize>,
    degraded: Arc<AtomicBool>,
    degraded_threshold: usize,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogQueue {
    /// Spawn the flush worker and return the queue handle.
    pub fn spawn(storage: Arc<Storage>, config: QueueConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));
        let degraded = Arc::new(AtomicBool::new(false));

        let degraded_threshold = config.degraded_threshold;
        let worker = tokio::spawn(flush_loop(
            storage,
            config,
            rx,
            shutdown_rx,
            Arc::clone(&depth),
            Arc::clone(&degraded),
        ));

        Arc::new(Self {
            tx,
            depth,
            degraded,
            degraded_threshold,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a completion row. Always accepted while the channel has
    /// capacity, degraded mode or not.
    pub fn enqueue_completion(&self, row: RequestLogRow) {
        self.push(row, true);
    }

    /// Enqueue a cache-hit row. Shed in degraded mode.
    pub fn enqueue_cache_hit(&self, row: RequestLogRow) {
        if self.degraded.load(Ordering::Relaxed) {
            debug!(request_id = row.request_id.as_str(), "degraded mode, shedding cache-hit row");
            return;
        }
        self.push(row, false);
    }

    fn push(&self, row: RequestLogRow, critical: bool) {
        // Count before sending so the flush side never sees more rows
        // than the recorded depth.
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.try_send(row) {
            Ok(()) => {
                if depth > self.degraded_threshold && !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(depth, "log queue entering degraded mode");
                }
            }
            Err(mpsc::error::TrySendError::Full(row)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                warn!(
                    request_id = row.request_id.as_str(),
                    critical, "log queue full, dropping row"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                warn!("log queue closed, dropping row");
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Signal the worker and wait for the final synchronous flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "log queue worker join failed");
            }
        }
    }
}

async fn flush_loop(
    storage: Arc<Storage>,
    config: QueueConfig,
    mut rx: mpsc::Receiver<RequestLogRow>,
    mut shutdown_rx: watch::Receiver<bool>,
    depth: Arc<AtomicUsize>,
    degraded: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(config.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                flush_pending(&storage, &config, &mut rx, &depth, &degraded).await;
            }
            _ = shutdown_rx.changed() => {
                flush_pending(&storage, &config, &mut rx, &depth, &degraded).await;
                info!("log queue drained on shutdown");
                break;
            }
        }
    }
}

async fn flush_pending(
    storage: &Storage,
    config: &QueueConfig,
    rx: &mut mpsc::Receiver<RequestLogRow>,
    depth: &AtomicUsize,
    degraded: &AtomicBool,
) {
    let mut batch = Vec::new();
    while let Ok(row) = rx.try_recv() {
        batch.push(row);
    }
    if batch.is_empty() {
        return;
    }

    match storage.insert_request_rows(&batch).await {
        Ok(()) => {
            debug!(rows = batch.len(), "log batch flushed");
        }
        Err(e) => {
            // Storage failures never propagate; the rows are lost.
            error!(error = %e, rows = batch.len(), "log batch write failed");
        }
    }

    let new_depth = depth
        .fetch_sub(batch.len(), Ordering::Relaxed)
        .saturating_sub(batch.len());
    if degraded.load(Ordering::Relaxed) && new_depth < config.degraded_threshold / 2 {
        degraded.store(false, Ordering::Relaxed);
        info!(depth = new_depth, "log queue exiting degraded mode");
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: &str, cache_hit: bool) -> RequestLogRow {
        RequestLogRow {
            request_id: id.to_string(),
            tenant_id: None,
            prompt_preview: "p".to_string(),
            tier: "trivial".to_string(),
            complexity_score: 1.0,
            confidence: 0.65,
            intent: "general".to_string(),
            model: "m".to_string(),
            provider: "mock".to_string(),
            strategy: "cost-first".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost: 0.0,
            energy: 0.0,
            latency_ms: 1.0,
            provider_status: Some(200),
            cache_hit,
            reasoning: String::new(),
            created_at: Utc::now(),
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            flush_interval: Duration::from_millis(20),
            degraded_threshold: 8,
            channel_capacity: 32,
        }
    }

    #[tokio::test]
    async fn test_rows_flushed_within_interval() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let queue = LogQueue::spawn(Arc::clone(&storage), fast_config());

        queue.enqueue_completion(row("r-1", false));
        queue.enqueue_completion(row("r-2", false));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_rows() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let queue = LogQueue::spawn(
            Arc::clone(&storage),
            QueueConfig {
                flush_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );

        queue.enqueue_completion(row("r-1", false));
        queue.shutdown().await;

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_sheds_cache_hits_not_completions() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        // Slow flush so the backlog builds
        let queue = LogQueue::spawn(
            Arc::clone(&storage),
            QueueConfig {
                flush_interval: Duration::from_secs(3600),
                degraded_threshold: 8,
                channel_capacity: 32,
            },
        );

        for i in 0..10 {
            queue.enqueue_completion(row(&format!("c-{i}"), false));
        }
        assert!(queue.is_degraded(), "depth 10 > threshold 8 must degrade");

        // Cache-hit rows are shed; completion rows still enqueue
        queue.enqueue_cache_hit(row("shed-me", true));
        queue.enqueue_completion(row("keep-me", false));
        assert_eq!(queue.depth(), 11);

        queue.shutdown().await;
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total_requests, 11);
        assert!(storage.find_request("keep-me").await.unwrap().is_some());
        assert!(storage.find_request("shed-me").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_degraded_mode_exits_after_drain() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let queue = LogQueue::spawn(Arc::clone(&storage), fast_config());

        for i in 0..10 {
            queue.enqueue_completion(row(&format!("r-{i}"), false));
        }
        assert!(queue.is_degraded());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!queue.is_degraded(), "flush must clear degraded mode");
        queue.enqueue_cache_hit(row("hit-1", true));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(storage.find_request("hit-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_channel_overflow_drops_rows_without_panic() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let queue = LogQueue::spawn(
            Arc::clone(&storage),
            QueueConfig {
                flush_interval: Duration::from_secs(3600),
                degraded_threshold: 4,
                channel_capacity: 16,
            },
        );
        for i in 0..40 {
            queue.enqueue_completion(row(&format!("r-{i}"), false));
        }
        // Only the first 16 fit; the rest were dropped
        queue.shutdown().await;
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total_requests, 16);
    }
}
