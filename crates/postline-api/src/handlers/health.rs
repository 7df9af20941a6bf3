//! Health check handlers for service monitoring.
//!
//! `/health` and `/live` cover the process and its database. `/ready` also
//! reports the outbound provider path: circuit breaker state and any active
//! rate-limit cooldown.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use postline_core::{Clock, StatusStore};
use postline_resilience::{CircuitBreaker, CircuitSnapshot, CircuitState, RateLimitGate};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Provider calls are currently refused or throttled
    Degraded,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity
    pub database: ComponentHealth,
    /// Outbound provider path, reported by readiness only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderHealth>,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Outbound provider state.
#[derive(Debug, Serialize)]
pub struct ProviderHealth {
    /// Shared circuit breaker counters and state
    pub circuit: CircuitSnapshot,
    /// Whether a 429 cooldown is active
    pub rate_limited: bool,
    /// Seconds left in the cooldown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Builds health reports, timestamped and timed with the injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Health service reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the database only.
    pub async fn health_check(&self, store: &dyn StatusStore) -> HealthResponse {
        let database = self.check_database_health(store).await;
        let status = match database.status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };
        self.response(status, HealthChecks { database, provider: None })
    }

    /// Checks the database and the provider path.
    pub async fn readiness_check(
        &self,
        store: &dyn StatusStore,
        breaker: &CircuitBreaker,
        rate_limit: &RateLimitGate,
    ) -> HealthResponse {
        let database = self.check_database_health(store).await;
        let remaining = rate_limit.remaining();
        let provider = ProviderHealth {
            circuit: breaker.snapshot(),
            rate_limited: remaining.is_some(),
            retry_after_secs: remaining.map(|d| d.as_secs()),
        };

        let status = if database.status == ComponentStatus::Down {
            HealthStatus::Unhealthy
        } else if provider.circuit.state == CircuitState::Open || provider.rate_limited {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        self.response(status, HealthChecks { database, provider: Some(provider) })
    }

    fn response(&self, status: HealthStatus, checks: HealthChecks) -> HealthResponse {
        HealthResponse {
            status,
            timestamp: self.clock.now_utc(),
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_database_health(&self, store: &dyn StatusStore) -> ComponentHealth {
        let start_time = self.clock.now();
        let result = store.health_check().await;
        let response_time_ms =
            u64::try_from(self.clock.now().saturating_duration_since(start_time).as_millis())
                .unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                debug!(response_time_ms, "Status store reachable");
                ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms }
            },
            Err(e) => {
                error!(error = %e, "Status store unreachable");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some("database unreachable".to_string()),
                    response_time_ms,
                }
            },
        }
    }
}

fn into_response(response: HealthResponse) -> Response {
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        db_status = ?response.checks.database.status,
        "Health check completed"
    );

    (status_code, Json(response)).into_response()
}

/// `GET /health`.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let health_service = HealthService::new(app_state.clock.clone());
    into_response(health_service.health_check(app_state.store.as_ref()).await)
}

/// Readiness check endpoint.
///
/// Degraded provider state still answers 200: webhook intake does not need
/// the provider.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    let health_service = HealthService::new(app_state.clock.clone());
    let response = health_service
        .readiness_check(app_state.store.as_ref(), &app_state.breaker, &app_state.rate_limit)
        .await;
    into_response(response)
}

/// Liveness check endpoint.
///
/// Does not touch external dependencies.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now_utc(),
        "service": "postline"
    });

    (StatusCode::OK, Json(response)).into_response()
}
