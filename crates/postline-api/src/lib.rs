//! Postline HTTP API: configuration, webhook ingestion, outbound mail
//! operations, metrics, alerting and the axum router.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use postline_core::{Clock, StatusStore};
use postline_resilience::{CircuitBreaker, RateLimitGate};

pub mod alert;
pub mod config;
pub mod crypto;
pub mod handlers;
pub mod ingest;
pub mod mail;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use ingest::{WebhookError, WebhookIngestor};
pub use mail::{MailError, MailService};
pub use metrics::WebhookMetrics;
pub use server::{create_router, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Webhook pipeline.
    pub ingestor: Arc<WebhookIngestor>,
    /// Persistence, for health checks.
    pub store: Arc<dyn StatusStore>,
    /// Outbound circuit breaker, for readiness.
    pub breaker: Arc<CircuitBreaker>,
    /// Outbound rate-limit gate, for readiness.
    pub rate_limit: Arc<RateLimitGate>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Outbound mail operations; `None` when no provider key is configured.
    pub mail: Option<Arc<MailService>>,
}

impl AppState {
    /// Builds state around an ingestor; the store is taken from it.
    pub fn new(
        ingestor: Arc<WebhookIngestor>,
        breaker: Arc<CircuitBreaker>,
        rate_limit: Arc<RateLimitGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = ingestor.store().clone();
        Self { ingestor, store, breaker, rate_limit, clock, mail: None }
    }

    /// Enables the outbound mail endpoints.
    ///
    /// The service's client should share `breaker` and `rate_limit` so
    /// readiness reflects its calls.
    #[must_use]
    pub fn with_mail(mut self, mail: Arc<MailService>) -> Self {
        self.mail = Some(mail);
        self
    }
}
