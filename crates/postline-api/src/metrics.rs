//! Process-wide webhook metrics.
//!
//! Counters live in memory behind one lock. Ingestion flushes a snapshot to
//! the store every K accepted events; [`MetricsFlusher`] can additionally
//! flush on a timer. A failed flush is logged and otherwise ignored.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use postline_core::{Clock, MetricsSnapshot, StatusStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Counters {
    snapshot: MetricsSnapshot,
    accepted_since_flush: u64,
}

/// Webhook metrics accumulator.
#[derive(Debug)]
pub struct WebhookMetrics {
    counters: Mutex<Counters>,
    clock: Arc<dyn Clock>,
}

impl WebhookMetrics {
    /// Creates zeroed metrics.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { counters: Mutex::new(Counters::default()), clock }
    }

    /// Records an event applied to persistence.
    pub fn record_success(&self, event_type: &str, elapsed: Duration) {
        let now = self.clock.now_utc();
        let mut counters = self.counters.lock();
        counters.snapshot.successful_events += 1;
        counters.accepted_since_flush += 1;
        record_processed(&mut counters.snapshot, event_type, elapsed);
        counters.snapshot.last_processed_at = Some(now);
    }

    /// Records an authenticated event that failed during processing.
    pub fn record_failure(&self, event_type: &str, elapsed: Duration) {
        let now = self.clock.now_utc();
        let mut counters = self.counters.lock();
        counters.snapshot.failed_events += 1;
        record_processed(&mut counters.snapshot, event_type, elapsed);
        counters.snapshot.last_processed_at = Some(now);
    }

    /// Records a redelivery answered without side effects.
    pub fn record_duplicate(&self) {
        let mut counters = self.counters.lock();
        counters.snapshot.total_events += 1;
        counters.snapshot.duplicate_events += 1;
    }

    /// Records a request rejected before processing.
    pub fn record_rejected(&self) {
        self.counters.lock().snapshot.rejected_events += 1;
    }

    /// Copies the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters.lock().snapshot.clone()
    }

    /// Accepted events since the last flush.
    pub fn accepted_since_flush(&self) -> u64 {
        self.counters.lock().accepted_since_flush
    }

    /// Whether `every` accepted events have accumulated since the last
    /// flush. `every == 0` disables count-based flushing.
    pub fn should_flush(&self, every: u64) -> bool {
        every > 0 && self.accepted_since_flush() >= every
    }

    /// Resets the flush counter.
    pub fn mark_flushed(&self) {
        self.counters.lock().accepted_since_flush = 0;
    }

    /// Atomically checks [`Self::should_flush`] and, if due, marks the flush
    /// and returns the snapshot to persist.
    pub fn take_due_snapshot(&self, every: u64) -> Option<MetricsSnapshot> {
        let mut counters = self.counters.lock();
        if every == 0 || counters.accepted_since_flush < every {
            return None;
        }
        counters.accepted_since_flush = 0;
        Some(counters.snapshot.clone())
    }

    /// Copies the counters and resets the flush counter under one lock.
    pub fn take_snapshot(&self) -> MetricsSnapshot {
        let mut counters = self.counters.lock();
        counters.accepted_since_flush = 0;
        counters.snapshot.clone()
    }

    /// Persists the current snapshot, logging failures.
    pub async fn flush_to(&self, store: &dyn StatusStore) {
        let snapshot = self.take_snapshot();
        persist_snapshot(store, &snapshot).await;
    }
}

fn record_processed(snapshot: &mut MetricsSnapshot, event_type: &str, elapsed: Duration) {
    snapshot.total_events += 1;

    let processed = snapshot.successful_events + snapshot.failed_events;
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    snapshot.average_processing_time_ms +=
        (elapsed_ms - snapshot.average_processing_time_ms) / processed as f64;

    *snapshot.events_by_type.entry(event_type.to_string()).or_insert(0) += 1;
}

pub(crate) async fn persist_snapshot(store: &dyn StatusStore, snapshot: &MetricsSnapshot) {
    match store.upsert_metrics_snapshot(snapshot).await {
        Ok(()) => debug!(total_events = snapshot.total_events, "metrics snapshot flushed"),
        Err(e) => warn!(error = %e, "failed to flush metrics snapshot"),
    }
}

/// Background timer that flushes metrics until cancelled.
pub struct MetricsFlusher;

impl MetricsFlusher {
    /// Spawns the flush loop. Flushes once more when `shutdown` fires.
    pub fn spawn(
        metrics: Arc<WebhookMetrics>,
        store: Arc<dyn StatusStore>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            timer.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = timer.tick() => metrics.flush_to(store.as_ref()).await,
                }
            }

            metrics.flush_to(store.as_ref()).await;
            info!("metrics flusher stopped");
        })
    }
}
