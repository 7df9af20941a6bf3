//! In-memory status store for tests.
//!
//! Behaves like the PostgreSQL store, including the dedupe-bucket
//! uniqueness check, which is evaluated under the same lock as the insert.
//! Supports injected failures and exposes what was written for assertions.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{dedupe_bucket, StatusStore, DEFAULT_DEDUPE_WINDOW};
use crate::{
    error::{CoreError, Result},
    models::{ExternalId, MailPiece, MetricsSnapshot, NewStatusTransition, StatusHistoryRecord},
    status::MailStatus,
    time::{Clock, RealClock},
};

#[derive(Default)]
struct State {
    history: Vec<(i64, StatusHistoryRecord)>,
    pieces: HashMap<ExternalId, MailPiece>,
    snapshots: Vec<MetricsSnapshot>,
    apply_failures: VecDeque<CoreError>,
    lookup_failures: VecDeque<CoreError>,
    snapshot_failures: VecDeque<CoreError>,
    apply_calls: usize,
    unhealthy: Option<String>,
}

/// Mock status store for testing ingestion without a database.
#[derive(Clone)]
pub struct MockStatusStore {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
    dedupe_window: Duration,
}

impl MockStatusStore {
    /// Creates an empty store on the real clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            clock,
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }

    /// Sets the dedupe bucket width.
    #[must_use]
    pub fn with_dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    /// Makes the next `count` transition writes fail with `error`.
    pub async fn fail_next_applies(&self, count: usize, error: CoreError) {
        let mut state = self.state.write().await;
        state.apply_failures.extend((0..count).map(|_| error.clone()));
    }

    /// Makes the next duplicate lookup fail with `error`.
    pub async fn fail_next_lookup(&self, error: CoreError) {
        self.state.write().await.lookup_failures.push_back(error);
    }

    /// Makes the next metrics snapshot write fail with `error`.
    pub async fn fail_next_snapshot(&self, error: CoreError) {
        self.state.write().await.snapshot_failures.push_back(error);
    }

    /// Marks the store unhealthy until cleared with `None`.
    pub async fn set_unhealthy(&self, reason: Option<String>) {
        self.state.write().await.unhealthy = reason;
    }

    /// Inserts a history row directly, bypassing dedupe checks.
    pub async fn seed_history(&self, record: StatusHistoryRecord) {
        let bucket = dedupe_bucket(record.recorded_at.timestamp(), self.dedupe_window);
        self.state.write().await.history.push((bucket, record));
    }

    /// All history rows in insertion order.
    pub async fn history(&self) -> Vec<StatusHistoryRecord> {
        self.state.read().await.history.iter().map(|(_, record)| record.clone()).collect()
    }

    /// History rows for one mail piece in insertion order.
    pub async fn history_for(&self, external_id: &ExternalId) -> Vec<StatusHistoryRecord> {
        self.state
            .read()
            .await
            .history
            .iter()
            .filter(|(_, record)| &record.external_id == external_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Every metrics snapshot written, oldest first.
    pub async fn metrics_snapshots(&self) -> Vec<MetricsSnapshot> {
        self.state.read().await.snapshots.clone()
    }

    /// Number of `apply_status_transition` calls, including failed ones.
    pub async fn apply_calls(&self) -> usize {
        self.state.read().await.apply_calls
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }
}

impl Default for MockStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore for MockStatusStore {
    fn find_recent_status<'a>(
        &'a self,
        external_id: &'a ExternalId,
        provider_status: &'a str,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StatusHistoryRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if let Some(error) = state.lookup_failures.pop_front() {
                return Err(error);
            }

            let window = chrono::Duration::from_std(window)
                .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
            let cutoff = self.now() - window;

            Ok(state
                .history
                .iter()
                .rev()
                .map(|(_, record)| record)
                .find(|record| {
                    &record.external_id == external_id
                        && record.provider_status == provider_status
                        && record.recorded_at >= cutoff
                })
                .cloned())
        })
    }

    fn apply_status_transition(
        &self,
        transition: NewStatusTransition,
    ) -> Pin<Box<dyn Future<Output = Result<StatusHistoryRecord>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.apply_calls += 1;
            if let Some(error) = state.apply_failures.pop_front() {
                return Err(error);
            }

            let recorded_at = self.now();
            let bucket = dedupe_bucket(recorded_at.timestamp(), self.dedupe_window);
            let collides = state.history.iter().any(|(existing, record)| {
                *existing == bucket
                    && record.external_id == transition.external_id
                    && record.provider_status == transition.provider_status
            });
            if collides {
                return Err(CoreError::ConstraintViolation(format!(
                    "status {} already recorded for {} in this window",
                    transition.provider_status, transition.external_id
                )));
            }

            if let Some(piece) = state.pieces.get_mut(&transition.external_id) {
                piece.status = transition.status;
                piece.provider_status = Some(transition.provider_status.clone());
                if transition.tracking_number.is_some() {
                    piece.tracking_number.clone_from(&transition.tracking_number);
                }
                piece.updated_at = recorded_at;
            }

            let record = StatusHistoryRecord {
                id: Uuid::new_v4(),
                external_id: transition.external_id,
                provider_status: transition.provider_status,
                status: transition.status,
                tracking_number: transition.tracking_number,
                raw_payload: transition.raw_payload,
                recorded_at,
            };
            state.history.push((bucket, record.clone()));
            Ok(record)
        })
    }

    fn register_mail_piece<'a>(
        &'a self,
        external_id: &'a ExternalId,
        status: MailStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let updated_at = self.now();
            self.state.write().await.pieces.entry(external_id.clone()).or_insert_with(|| {
                MailPiece {
                    external_id: external_id.clone(),
                    status,
                    provider_status: None,
                    tracking_number: None,
                    updated_at,
                }
            });
            Ok(())
        })
    }

    fn find_mail_piece<'a>(
        &'a self,
        external_id: &'a ExternalId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MailPiece>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.state.read().await.pieces.get(external_id).cloned()) })
    }

    fn upsert_metrics_snapshot<'a>(
        &'a self,
        snapshot: &'a MetricsSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if let Some(error) = state.snapshot_failures.pop_front() {
                return Err(error);
            }
            state.snapshots.push(snapshot.clone());
            Ok(())
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            match &self.state.read().await.unhealthy {
                Some(reason) => Err(CoreError::Database(reason.clone())),
                None => Ok(()),
            }
        })
    }
}
