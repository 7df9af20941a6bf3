//! Core domain models and strongly-typed identifiers.
//!
//! Defines the provider-assigned external identifier, persisted status
//! history rows, the write model for a status transition, and the webhook
//! metrics snapshot that ingestion flushes to storage.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::MailStatus;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Provider-assigned identifier of a mail piece.
///
/// Correlates the outbound creation call with every inbound status webhook
/// for the same object. Opaque to this system.
///
/// # Example
///
/// ```
/// use postline_core::ExternalId;
/// let id = ExternalId::new("ltr_4868c3b754655f90");
/// assert_eq!(id.as_str(), "ltr_4868c3b754655f90");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(pub String);

impl ExternalId {
    /// Wraps a provider identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExternalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ExternalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl sqlx::Type<PgDb> for ExternalId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ExternalId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for ExternalId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Current state of a mail piece known to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailPiece {
    /// Provider identifier.
    pub external_id: ExternalId,
    /// Latest translated status.
    pub status: MailStatus,
    /// Latest provider status string, if any webhook has been applied.
    pub provider_status: Option<String>,
    /// Carrier tracking number, once known.
    pub tracking_number: Option<String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// One accepted status transition for a mail piece.
///
/// Rows are append-only. The history is also the de-duplication source of
/// truth: a row for the same external id and provider status inside the
/// dedupe window means the event was already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryRecord {
    /// Row identifier.
    pub id: Uuid,
    /// Provider identifier of the mail piece.
    pub external_id: ExternalId,
    /// Status string exactly as the provider sent it.
    pub provider_status: String,
    /// Translated internal status.
    pub status: MailStatus,
    /// Carrier tracking number, when the provider supplied one.
    pub tracking_number: Option<String>,
    /// Raw webhook payload.
    pub raw_payload: serde_json::Value,
    /// When the transition was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Write model for applying a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusTransition {
    /// Provider identifier of the mail piece.
    pub external_id: ExternalId,
    /// Status string exactly as the provider sent it.
    pub provider_status: String,
    /// Translated internal status.
    pub status: MailStatus,
    /// Carrier tracking number, if present in the event.
    pub tracking_number: Option<String>,
    /// Raw webhook payload to append to history.
    pub raw_payload: serde_json::Value,
}

/// Point-in-time copy of the webhook metrics accumulator.
///
/// The persisted snapshot may lag the in-memory counters; it exists for
/// operators, not for correctness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Authenticated events seen (successes, failures and duplicates).
    pub total_events: u64,
    /// Events applied to persistence.
    pub successful_events: u64,
    /// Events that failed during processing.
    pub failed_events: u64,
    /// Redeliveries answered without side effects.
    pub duplicate_events: u64,
    /// Requests rejected for protocol reasons (headers, signature, payload).
    pub rejected_events: u64,
    /// Mean processing time over processed events, in milliseconds.
    pub average_processing_time_ms: f64,
    /// Processed events per provider event type.
    pub events_by_type: BTreeMap<String, u64>,
    /// When the last event finished processing.
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// Fraction of processed events that failed, between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        let processed = self.successful_events + self.failed_events;
        if processed == 0 {
            0.0
        } else {
            self.failed_events as f64 / processed as f64
        }
    }
}
