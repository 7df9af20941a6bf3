//! Persistence boundary for webhook ingestion.
//!
//! Ingestion only talks to [`StatusStore`]. Production wires in
//! [`PostgresStatusStore`]; tests use [`mock::MockStatusStore`], which keeps
//! the same de-duplication guarantees in memory.

use std::{future::Future, pin::Pin, time::Duration};

use crate::{
    error::Result,
    models::{ExternalId, MailPiece, MetricsSnapshot, NewStatusTransition, StatusHistoryRecord},
    status::MailStatus,
};

pub mod mock;
mod postgres;

pub use postgres::{migrate, PostgresStatusStore};

/// Default window inside which a repeated (id, provider status) pair is a
/// redelivery.
pub const DEFAULT_DEDUPE_WINDOW: Duration = Duration::from_secs(60);

/// Storage operations required by webhook ingestion.
pub trait StatusStore: Send + Sync + 'static {
    /// Finds a history row for `external_id` with the same provider status
    /// recorded within the last `window`.
    fn find_recent_status<'a>(
        &'a self,
        external_id: &'a ExternalId,
        provider_status: &'a str,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StatusHistoryRecord>>> + Send + 'a>>;

    /// Appends a status history row and updates the mail piece, if one is
    /// registered, in a single atomic step.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` when the same transition was
    /// already recorded in the current dedupe bucket, and
    /// `CoreError::Database` when the store is unreachable.
    fn apply_status_transition(
        &self,
        transition: NewStatusTransition,
    ) -> Pin<Box<dyn Future<Output = Result<StatusHistoryRecord>> + Send + '_>>;

    /// Registers a mail piece after a successful creation call.
    ///
    /// Registering an already known id is a no-op.
    fn register_mail_piece<'a>(
        &'a self,
        external_id: &'a ExternalId,
        status: MailStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Looks up the current state of a mail piece.
    fn find_mail_piece<'a>(
        &'a self,
        external_id: &'a ExternalId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MailPiece>>> + Send + 'a>>;

    /// Replaces the persisted webhook metrics snapshot.
    fn upsert_metrics_snapshot<'a>(
        &'a self,
        snapshot: &'a MetricsSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Verifies the store is reachable.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Index of the fixed-size time bucket `unix_seconds` falls into.
///
/// Two identical transitions in the same bucket collide on the store's
/// uniqueness constraint.
pub fn dedupe_bucket(unix_seconds: i64, window: Duration) -> i64 {
    let width = i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1);
    unix_seconds.div_euclid(width)
}
