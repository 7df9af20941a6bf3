//! Signed webhook ingestion.
//!
//! [`WebhookIngestor::process_webhook`] runs one provider delivery through
//! the full pipeline:
//!
//! 1. **Authenticate** - require both signature headers, verify the HMAC over
//!    the raw body, then check the timestamp tolerance
//! 2. **Parse** - decode JSON and resolve the mail piece id, provider status
//!    and the descriptive fields
//! 3. **De-duplicate** - answer a redelivery inside the dedupe window without
//!    writing anything
//! 4. **Apply** - translate the status and persist the transition, retrying
//!    transient store errors
//! 5. **Account** - update metrics, flush every K accepted events, and alert
//!    operators after sustained failures
//!
//! Steps 1 and 2 reject with a 4xx and are never retried.

use std::{sync::Arc, time::Duration};

use axum::http::StatusCode;
use postline_core::{
    storage::DEFAULT_DEDUPE_WINDOW, Clock, CoreError, ExternalId, NewStatusTransition,
    StatusStore, StatusTranslator,
};
use postline_resilience::{retry_with_backoff, RetryPolicy};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::{
    alert::{FailureTracker, OperatorAlerter},
    crypto::{self, SignatureError, DEFAULT_TOLERANCE},
    metrics::{persist_snapshot, WebhookMetrics},
};

/// Ingestion failures, each mapped to an HTTP status and a stable code.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// A signature header is missing or empty.
    #[error("signature and signature-timestamp headers are required")]
    MissingHeaders,
    /// The signature does not match the body.
    #[error("invalid webhook signature")]
    InvalidSignature,
    /// The timestamp is unparseable or outside the tolerance.
    #[error("webhook timestamp is outside the accepted window")]
    StaleTimestamp,
    /// The body is not a JSON object.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// No mail piece id could be resolved.
    #[error("payload does not identify a mail piece")]
    MissingId,
    /// No provider status could be resolved.
    #[error("payload does not carry a status")]
    MissingStatus,
    /// The transition could not be persisted.
    #[error("webhook could not be processed")]
    PersistenceFailed(#[source] CoreError),
    /// No webhook secret is configured.
    #[error("webhook verification is not configured")]
    Configuration,
}

impl WebhookError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingHeaders => "MISSING_HEADERS",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::MissingId => "MISSING_ID",
            Self::MissingStatus => "MISSING_STATUS",
            Self::PersistenceFailed(_) => "PERSISTENCE_FAILED",
            Self::Configuration => "CONFIGURATION_ERROR",
        }
    }

    /// HTTP status for the response.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingHeaders | Self::InvalidPayload(_) | Self::MissingId | Self::MissingStatus => {
                StatusCode::BAD_REQUEST
            },
            Self::InvalidSignature | Self::StaleTimestamp => StatusCode::UNAUTHORIZED,
            Self::PersistenceFailed(_) | Self::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the request was rejected before processing.
    pub fn is_rejection(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Source of the webhook signing secret.
pub trait WebhookSecretProvider: Send + Sync {
    /// Current secret, or `None` if not configured.
    fn webhook_secret(&self) -> Option<String>;
}

/// Secret fixed at startup.
#[derive(Clone, Default)]
pub struct StaticSecret(Option<String>);

impl StaticSecret {
    /// Wraps a configured secret. Empty strings count as unset.
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self((!secret.is_empty()).then_some(secret))
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticSecret").field(&self.0.as_ref().map(|_| "[redacted]")).finish()
    }
}

impl WebhookSecretProvider for StaticSecret {
    fn webhook_secret(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Ingestion tuning.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Accepted distance between the signature timestamp and local time.
    pub tolerance: Duration,
    /// Window inside which a repeated (id, status) pair is a redelivery.
    pub dedupe_window: Duration,
    /// Flush metrics every this many accepted events; 0 disables.
    pub flush_every: u64,
    /// Consecutive failures before an operator alert.
    pub alert_threshold: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
            flush_every: 10,
            alert_threshold: 5,
        }
    }
}

/// One parsed provider event.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// Provider id of the mail piece.
    pub id: ExternalId,
    /// Provider status string.
    pub status: String,
    /// Carrier tracking number, if supplied.
    pub tracking_number: Option<String>,
    /// Provider object type, `"unknown"` if absent.
    pub object_type: String,
    /// Provider event type.
    pub event_type: String,
    /// Complete decoded payload.
    pub raw_payload: Value,
}

impl WebhookEvent {
    /// Resolves event fields from a decoded payload.
    ///
    /// Lookup order:
    /// - id: `body.id`, `data.id`, top-level `id`
    /// - status: `body.status`, suffix of `event_type.id` after the last
    ///   `.`, top-level `status`
    /// - tracking number: `body.tracking_number`, top-level
    ///   `tracking_number`
    /// - object type: `body.object`, `event_type.resource`, top-level
    ///   `object`, else `"unknown"`
    /// - event type: `event_type.id`, `event_type` as a string, else
    ///   `"{object_type}.{status}"`
    ///
    /// Empty strings count as absent.
    pub fn from_payload(payload: Value) -> Result<Self, WebhookError> {
        if !payload.is_object() {
            return Err(WebhookError::InvalidPayload("expected a JSON object".to_string()));
        }

        let event_type_id = text(&payload, &["event_type", "id"]);

        let id = text(&payload, &["body", "id"])
            .or_else(|| text(&payload, &["data", "id"]))
            .or_else(|| text(&payload, &["id"]))
            .ok_or(WebhookError::MissingId)?
            .to_string();

        let status = text(&payload, &["body", "status"])
            .or_else(|| {
                event_type_id
                    .and_then(|event_type| event_type.rsplit_once('.'))
                    .map(|(_, suffix)| suffix)
                    .filter(|suffix| !suffix.is_empty())
            })
            .or_else(|| text(&payload, &["status"]))
            .ok_or(WebhookError::MissingStatus)?
            .to_string();

        let tracking_number = text(&payload, &["body", "tracking_number"])
            .or_else(|| text(&payload, &["tracking_number"]))
            .map(str::to_string);

        let object_type = text(&payload, &["body", "object"])
            .or_else(|| text(&payload, &["event_type", "resource"]))
            .or_else(|| text(&payload, &["object"]))
            .unwrap_or("unknown")
            .to_string();

        let event_type = event_type_id
            .or_else(|| text(&payload, &["event_type"]))
            .map_or_else(|| format!("{object_type}.{status}"), str::to_string);

        Ok(Self {
            id: ExternalId::new(id),
            status,
            tracking_number,
            object_type,
            event_type,
            raw_payload: payload,
        })
    }
}

fn text<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(payload, |value, key| value.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Successful ingestion response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Always `true`.
    pub received: bool,
    /// Set when the event was a redelivery.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    /// Provider id of the mail piece.
    pub id: String,
    /// Provider event type.
    pub event_type: String,
    /// Time spent processing, in milliseconds.
    pub processing_time_ms: u64,
}

/// Webhook processing pipeline shared by all requests.
pub struct WebhookIngestor {
    store: Arc<dyn StatusStore>,
    secrets: Arc<dyn WebhookSecretProvider>,
    alerter: Arc<dyn OperatorAlerter>,
    metrics: Arc<WebhookMetrics>,
    failures: FailureTracker,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
    persist_policy: RetryPolicy<CoreError>,
}

impl WebhookIngestor {
    /// Builds an ingestor with fresh metrics.
    pub fn new(
        store: Arc<dyn StatusStore>,
        secrets: Arc<dyn WebhookSecretProvider>,
        alerter: Arc<dyn OperatorAlerter>,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
    ) -> Self {
        Self {
            metrics: Arc::new(WebhookMetrics::new(clock.clone())),
            failures: FailureTracker::new(config.alert_threshold),
            persist_policy: RetryPolicy::webhook_processing()
                .with_retry_condition(CoreError::is_transient),
            store,
            secrets,
            alerter,
            clock,
            config,
        }
    }

    /// Shared metrics accumulator.
    pub fn metrics(&self) -> &Arc<WebhookMetrics> {
        &self.metrics
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Runs one delivery through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError`] whose `status_code()` is the HTTP answer.
    #[instrument(
        name = "process_webhook",
        skip_all,
        fields(
            body_len = body.len(),
            external_id = tracing::field::Empty,
            provider_status = tracing::field::Empty,
        )
    )]
    pub async fn process_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<IngestResponse, WebhookError> {
        let started = self.clock.now();

        let event = match self.authenticate_and_parse(body, signature, timestamp) {
            Ok(event) => event,
            Err(e) => {
                if e.is_rejection() {
                    self.metrics.record_rejected();
                    warn!(code = e.code(), error = %e, "webhook rejected");
                } else {
                    error!(code = e.code(), error = %e, "webhook cannot be verified");
                }
                return Err(e);
            },
        };

        let span = Span::current();
        span.record("external_id", event.id.as_str());
        span.record("provider_status", event.status.as_str());

        match self.apply(&event).await {
            Ok(true) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                self.on_success(&event, elapsed).await;
                Ok(IngestResponse {
                    received: true,
                    duplicate: false,
                    id: event.id.to_string(),
                    event_type: event.event_type,
                    processing_time_ms: millis(elapsed),
                })
            },
            Ok(false) => {
                self.metrics.record_duplicate();
                info!(event_type = %event.event_type, "duplicate webhook ignored");
                Ok(IngestResponse {
                    received: true,
                    duplicate: true,
                    id: event.id.to_string(),
                    event_type: event.event_type,
                    processing_time_ms: millis(
                        self.clock.now().saturating_duration_since(started),
                    ),
                })
            },
            Err(e) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                self.on_failure(&event, &e, elapsed).await;
                Err(WebhookError::PersistenceFailed(e))
            },
        }
    }

    fn authenticate_and_parse(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<WebhookEvent, WebhookError> {
        let (Some(signature), Some(timestamp)) = (non_empty(signature), non_empty(timestamp))
        else {
            return Err(WebhookError::MissingHeaders);
        };

        let secret = self.secrets.webhook_secret().ok_or(WebhookError::Configuration)?;

        crypto::verify_signature(&secret, timestamp, body, signature).map_err(|e| match e {
            SignatureError::InvalidSecret => WebhookError::Configuration,
            _ => WebhookError::InvalidSignature,
        })?;

        crypto::verify_timestamp(timestamp, self.clock.unix_seconds(), self.config.tolerance)
            .map_err(|_| WebhookError::StaleTimestamp)?;

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        WebhookEvent::from_payload(payload)
    }

    /// Returns `Ok(true)` when a new transition was written and `Ok(false)`
    /// for a redelivery.
    async fn apply(&self, event: &WebhookEvent) -> Result<bool, CoreError> {
        let window = self.config.dedupe_window;
        let existing = retry_with_backoff(self.clock.as_ref(), &self.persist_policy, || {
            self.store.find_recent_status(&event.id, &event.status, window)
        })
        .await?;

        if let Some(record) = existing {
            debug!(history_id = %record.id, "transition already recorded in window");
            return Ok(false);
        }

        let status = StatusTranslator::map(&event.status);
        let transition = NewStatusTransition {
            external_id: event.id.clone(),
            provider_status: event.status.clone(),
            status,
            tracking_number: event.tracking_number.clone(),
            raw_payload: event.raw_payload.clone(),
        };

        let written = retry_with_backoff(self.clock.as_ref(), &self.persist_policy, || {
            self.store.apply_status_transition(transition.clone())
        })
        .await;

        match written {
            Ok(record) => {
                info!(history_id = %record.id, status = %record.status, "status transition applied");
                Ok(true)
            },
            Err(e) if e.is_conflict() => {
                debug!("concurrent delivery won the write");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    async fn on_success(&self, event: &WebhookEvent, elapsed: Duration) {
        self.metrics.record_success(&event.event_type, elapsed);
        self.failures.record_success();

        if let Some(snapshot) = self.metrics.take_due_snapshot(self.config.flush_every) {
            persist_snapshot(self.store.as_ref(), &snapshot).await;
        }
    }

    async fn on_failure(&self, event: &WebhookEvent, cause: &CoreError, elapsed: Duration) {
        self.metrics.record_failure(&event.event_type, elapsed);
        error!(error = %cause, event_type = %event.event_type, "webhook processing failed");

        let Some(consecutive) = self.failures.record_failure() else {
            return;
        };

        let snapshot = self.metrics.snapshot();
        let body = format!(
            "{consecutive} consecutive webhook processing failures. Error rate {:.1}% ({} of {} \
             processed events). Last error: {cause}",
            snapshot.error_rate() * 100.0,
            snapshot.failed_events,
            snapshot.successful_events + snapshot.failed_events,
        );

        if let Err(e) =
            self.alerter.send_operator_alert("Webhook processing failures", &body).await
        {
            error!(error = %e, "failed to send operator alert");
        }
    }
}

impl std::fmt::Debug for WebhookIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIngestor")
            .field("config", &self.config)
            .field("consecutive_failures", &self.failures.consecutive_failures())
            .finish_non_exhaustive()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
