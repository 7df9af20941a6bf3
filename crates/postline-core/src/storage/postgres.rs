//! PostgreSQL implementation of [`StatusStore`].
//!
//! Each status transition runs in its own transaction: the history insert and
//! the mail-piece update commit together or not at all. Concurrent duplicate
//! deliveries are caught by the unique `(external_id, provider_status,
//! dedupe_bucket)` constraint and surface as
//! [`CoreError::ConstraintViolation`](crate::CoreError::ConstraintViolation).

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{StatusStore, DEFAULT_DEDUPE_WINDOW};
use crate::{
    error::{CoreError, Result},
    models::{ExternalId, MailPiece, MetricsSnapshot, NewStatusTransition, StatusHistoryRecord},
    status::MailStatus,
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS mail_pieces (
        external_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        provider_status TEXT,
        tracking_number TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS status_history (
        id UUID PRIMARY KEY,
        external_id TEXT NOT NULL,
        provider_status TEXT NOT NULL,
        status TEXT NOT NULL,
        tracking_number TEXT,
        raw_payload JSONB NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        dedupe_bucket BIGINT NOT NULL,
        CONSTRAINT status_history_dedupe UNIQUE (external_id, provider_status, dedupe_bucket)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_status_history_recent
        ON status_history (external_id, provider_status, recorded_at DESC)
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_metrics (
        id SMALLINT PRIMARY KEY CHECK (id = 1),
        total_events BIGINT NOT NULL,
        successful_events BIGINT NOT NULL,
        failed_events BIGINT NOT NULL,
        duplicate_events BIGINT NOT NULL,
        rejected_events BIGINT NOT NULL,
        average_processing_time_ms DOUBLE PRECISION NOT NULL,
        events_by_type JSONB NOT NULL,
        last_processed_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
];

/// Creates the tables used by [`PostgresStatusStore`] if they do not exist.
///
/// # Errors
///
/// Returns `CoreError::Database` if any DDL statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        pool.execute(*statement).await?;
    }
    debug!(tables = SCHEMA.len(), "status schema ready");
    Ok(())
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    external_id: String,
    provider_status: String,
    status: String,
    tracking_number: Option<String>,
    raw_payload: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for StatusHistoryRecord {
    type Error = CoreError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            external_id: ExternalId(row.external_id),
            provider_status: row.provider_status,
            status: row.status.parse()?,
            tracking_number: row.tracking_number,
            raw_payload: row.raw_payload,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MailPieceRow {
    external_id: String,
    status: String,
    provider_status: Option<String>,
    tracking_number: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MailPieceRow> for MailPiece {
    type Error = CoreError;

    fn try_from(row: MailPieceRow) -> Result<Self> {
        Ok(Self {
            external_id: ExternalId(row.external_id),
            status: row.status.parse()?,
            provider_status: row.provider_status,
            tracking_number: row.tracking_number,
            updated_at: row.updated_at,
        })
    }
}

/// Status store backed by a shared PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresStatusStore {
    pool: Arc<PgPool>,
    dedupe_window: Duration,
}

impl PostgresStatusStore {
    /// Creates a store using the default 60 second dedupe bucket width.
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool), dedupe_window: DEFAULT_DEDUPE_WINDOW }
    }

    /// Sets the dedupe bucket width used for the uniqueness constraint.
    #[must_use]
    pub fn with_dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    #[instrument(skip(self), fields(external_id = %external_id))]
    async fn find_recent_impl(
        &self,
        external_id: &ExternalId,
        provider_status: &str,
        window: Duration,
    ) -> Result<Option<StatusHistoryRecord>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            r"
            SELECT id, external_id, provider_status, status, tracking_number,
                   raw_payload, recorded_at
            FROM status_history
            WHERE external_id = $1
              AND provider_status = $2
              AND recorded_at >= NOW() - make_interval(secs => $3)
            ORDER BY recorded_at DESC
            LIMIT 1
            ",
        )
        .bind(external_id)
        .bind(provider_status)
        .bind(window.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await?;

        row.map(StatusHistoryRecord::try_from).transpose()
    }

    #[instrument(
        skip(self, transition),
        fields(external_id = %transition.external_id, status = %transition.status)
    )]
    async fn apply_impl(&self, transition: NewStatusTransition) -> Result<StatusHistoryRecord> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();
        let bucket_width = i64::try_from(self.dedupe_window.as_secs()).unwrap_or(i64::MAX).max(1);

        let recorded_at: DateTime<Utc> = sqlx::query_scalar(
            r"
            INSERT INTO status_history (
                id, external_id, provider_status, status, tracking_number,
                raw_payload, recorded_at, dedupe_bucket
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NOW(),
                FLOOR(EXTRACT(EPOCH FROM NOW()) / $7)::BIGINT
            )
            RETURNING recorded_at
            ",
        )
        .bind(id)
        .bind(&transition.external_id)
        .bind(&transition.provider_status)
        .bind(transition.status.as_str())
        .bind(&transition.tracking_number)
        .bind(&transition.raw_payload)
        .bind(bucket_width)
        .fetch_one(&mut *tx)
        .await?;

        let updated = update_mail_piece(&mut *tx, &transition).await?;
        tx.commit().await?;

        debug!(mail_piece_updated = updated, "status transition recorded");

        Ok(StatusHistoryRecord {
            id,
            external_id: transition.external_id,
            provider_status: transition.provider_status,
            status: transition.status,
            tracking_number: transition.tracking_number,
            raw_payload: transition.raw_payload,
            recorded_at,
        })
    }

    async fn register_impl(&self, external_id: &ExternalId, status: MailStatus) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO mail_pieces (external_id, status)
            VALUES ($1, $2)
            ON CONFLICT (external_id) DO NOTHING
            ",
        )
        .bind(external_id)
        .bind(status.as_str())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn find_mail_piece_impl(&self, external_id: &ExternalId) -> Result<Option<MailPiece>> {
        let row: Option<MailPieceRow> = sqlx::query_as(
            r"
            SELECT external_id, status, provider_status, tracking_number, updated_at
            FROM mail_pieces
            WHERE external_id = $1
            ",
        )
        .bind(external_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(MailPiece::try_from).transpose()
    }

    async fn upsert_metrics_impl(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhook_metrics (
                id, total_events, successful_events, failed_events,
                duplicate_events, rejected_events, average_processing_time_ms,
                events_by_type, last_processed_at, updated_at
            ) VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (id) DO UPDATE SET
                total_events = EXCLUDED.total_events,
                successful_events = EXCLUDED.successful_events,
                failed_events = EXCLUDED.failed_events,
                duplicate_events = EXCLUDED.duplicate_events,
                rejected_events = EXCLUDED.rejected_events,
                average_processing_time_ms = EXCLUDED.average_processing_time_ms,
                events_by_type = EXCLUDED.events_by_type,
                last_processed_at = EXCLUDED.last_processed_at,
                updated_at = NOW()
            ",
        )
        .bind(to_i64(snapshot.total_events))
        .bind(to_i64(snapshot.successful_events))
        .bind(to_i64(snapshot.failed_events))
        .bind(to_i64(snapshot.duplicate_events))
        .bind(to_i64(snapshot.rejected_events))
        .bind(snapshot.average_processing_time_ms)
        .bind(sqlx::types::Json(&snapshot.events_by_type))
        .bind(snapshot.last_processed_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

async fn update_mail_piece<'e, E>(executor: E, transition: &NewStatusTransition) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r"
        UPDATE mail_pieces
        SET status = $2,
            provider_status = $3,
            tracking_number = COALESCE($4, tracking_number),
            updated_at = NOW()
        WHERE external_id = $1
        ",
    )
    .bind(&transition.external_id)
    .bind(transition.status.as_str())
    .bind(&transition.provider_status)
    .bind(&transition.tracking_number)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl StatusStore for PostgresStatusStore {
    fn find_recent_status<'a>(
        &'a self,
        external_id: &'a ExternalId,
        provider_status: &'a str,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StatusHistoryRecord>>> + Send + 'a>> {
        Box::pin(self.find_recent_impl(external_id, provider_status, window))
    }

    fn apply_status_transition(
        &self,
        transition: NewStatusTransition,
    ) -> Pin<Box<dyn Future<Output = Result<StatusHistoryRecord>> + Send + '_>> {
        Box::pin(self.apply_impl(transition))
    }

    fn register_mail_piece<'a>(
        &'a self,
        external_id: &'a ExternalId,
        status: MailStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.register_impl(external_id, status))
    }

    fn find_mail_piece<'a>(
        &'a self,
        external_id: &'a ExternalId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MailPiece>>> + Send + 'a>> {
        Box::pin(self.find_mail_piece_impl(external_id))
    }

    fn upsert_metrics_snapshot<'a>(
        &'a self,
        snapshot: &'a MetricsSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.upsert_metrics_impl(snapshot))
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
            Ok(())
        })
    }
}
