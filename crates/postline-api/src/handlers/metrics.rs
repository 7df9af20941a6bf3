//! Webhook metrics endpoint.

use axum::{extract::State, Json};
use postline_core::MetricsSnapshot;
use tracing::instrument;

use crate::AppState;

/// Returns the live webhook metrics.
#[instrument(name = "webhook_metrics", skip(state))]
pub async fn webhook_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.ingestor.metrics().snapshot())
}
