//! Outbound mail endpoints used by the application.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use postline_core::ExternalId;
use postline_resilience::{
    client::{AddressInput, CostRequest, CreateMailRequest},
    ProviderError,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::create_error_response;
use crate::{
    mail::{MailError, MailService},
    AppState,
};

/// Header a caller may set to make a letter creation retry-safe.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// `POST /mail/address-verifications`.
#[instrument(name = "verify_address", skip_all)]
pub async fn verify_address(
    State(state): State<AppState>,
    Json(address): Json<AddressInput>,
) -> Response {
    let Some(mail) = mail_service(&state) else {
        return not_configured();
    };
    match mail.verify_address(&address).await {
        Ok(verification) => Json(verification).into_response(),
        Err(e) => mail_error_response(&e),
    }
}

/// `POST /mail/costs`.
#[instrument(name = "calculate_cost", skip_all)]
pub async fn calculate_cost(
    State(state): State<AppState>,
    Json(request): Json<CostRequest>,
) -> Response {
    let Some(mail) = mail_service(&state) else {
        return not_configured();
    };
    match mail.calculate_cost(&request).await {
        Ok(estimate) => Json(estimate).into_response(),
        Err(e) => mail_error_response(&e),
    }
}

/// `POST /mail/letters`.
///
/// Uses the caller's `Idempotency-Key` when sent, otherwise a fresh one.
#[instrument(name = "create_letter", skip_all)]
pub async fn create_letter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<CreateMailRequest>,
) -> Response {
    let Some(mail) = mail_service(&state) else {
        return not_configured();
    };
    request.idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    match mail.send_letter(&request).await {
        Ok(letter) => (StatusCode::CREATED, Json(letter)).into_response(),
        Err(e) => mail_error_response(&e),
    }
}

/// `GET /mail/letters/{id}`.
#[instrument(name = "get_letter", skip(state))]
pub async fn get_letter(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(mail) = mail_service(&state) else {
        return not_configured();
    };
    match mail.fetch_status(&ExternalId::new(id)).await {
        Ok(letter) => Json(letter).into_response(),
        Err(e) => mail_error_response(&e),
    }
}

fn mail_service(state: &AppState) -> Option<&MailService> {
    state.mail.as_deref()
}

fn not_configured() -> Response {
    create_error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "PROVIDER_NOT_CONFIGURED",
        "outbound provider calls are disabled",
    )
}

fn mail_error_response(error: &MailError) -> Response {
    let provider = match error {
        MailError::Provider(provider) => provider,
        MailError::Registration { external_id, .. } => {
            return create_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "REGISTRATION_FAILED",
                format!("mail piece {external_id} was created but could not be recorded"),
            );
        },
    };

    warn!(error = %provider, "outbound mail call failed");
    let (status, code) = match provider {
        ProviderError::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        ProviderError::Client { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "PROVIDER_REJECTED"),
        ProviderError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        ProviderError::CircuitOpen | ProviderError::Cancelled => {
            (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_UNAVAILABLE")
        },
        ProviderError::Configuration { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
        },
        ProviderError::Network { .. }
        | ProviderError::Timeout { .. }
        | ProviderError::Server { .. }
        | ProviderError::Decode { .. } => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
    };

    let mut response = create_error_response(status, code, provider.user_message());
    if let Some(seconds) = provider.retry_after_seconds() {
        if let Ok(value) = seconds.to_string().parse() {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }
    }
    response
}
