//! Provider webhook intake.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tracing::{info, instrument};

use super::create_error_response;
use crate::{
    crypto::{SIGNATURE_HEADER, TIMESTAMP_HEADER},
    AppState,
};

/// Verifies and applies one provider webhook.
///
/// Answers 200 for accepted and duplicate events, 400 for missing headers
/// or unusable payloads, 401 for bad signatures or stale timestamps, and
/// 500 when the event could not be persisted.
#[instrument(
    name = "receive_webhook",
    skip(state, headers, body),
    fields(content_length = body.len())
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);

    match state.ingestor.process_webhook(&body, signature, timestamp).await {
        Ok(response) => {
            info!(
                id = %response.id,
                event_type = %response.event_type,
                duplicate = response.duplicate,
                "webhook acknowledged"
            );
            (StatusCode::OK, Json(response)).into_response()
        },
        Err(e) => create_error_response(e.status_code(), e.code(), e.to_string()),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
