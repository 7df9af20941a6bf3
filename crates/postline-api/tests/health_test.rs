//! Health, readiness and liveness endpoint tests.

mod common;

use std::collections::HashMap;

use axum::http::StatusCode;
use common::{app, json_body};
use postline_resilience::ProviderError;

#[tokio::test]
async fn health_is_healthy_when_store_answers() {
    let app = app();

    let response = app.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "up");
    assert!(body["checks"].get("provider").is_none());
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn unreachable_store_is_unhealthy() {
    let app = app();
    app.store.set_unhealthy(Some("connection refused to 10.0.0.5".into())).await;

    let response = app.get("/health").await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "down");
    assert!(!body.to_string().contains("10.0.0.5"));
}

#[tokio::test]
async fn readiness_reports_provider_state() {
    let app = app();

    let response = app.get("/ready").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["provider"]["circuit"]["state"], "closed");
    assert_eq!(body["checks"]["provider"]["rate_limited"], false);
}

#[tokio::test]
async fn open_circuit_degrades_readiness() {
    let app = app();
    for _ in 0..app.state.breaker.config().failure_threshold {
        app.state.breaker.on_failure();
    }

    let response = app.get("/ready").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["provider"]["circuit"]["state"], "open");
    assert_eq!(body["checks"]["provider"]["circuit"]["times_opened"], 1);
}

#[tokio::test]
async fn rate_limit_cooldown_degrades_readiness() {
    let app = app();
    let headers = HashMap::from([("Retry-After".to_string(), "30".to_string())]);
    app.state.rate_limit.handle_rate_limit_error(&ProviderError::rate_limited(headers));

    let body = json_body(app.get("/ready").await).await;

    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["provider"]["rate_limited"], true);
    assert_eq!(body["checks"]["provider"]["retry_after_secs"], 30);
}

#[tokio::test]
async fn readiness_fails_without_store() {
    let app = app();
    app.store.set_unhealthy(Some("down".into())).await;

    let response = app.get("/ready").await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn liveness_ignores_dependencies() {
    let app = app();
    app.store.set_unhealthy(Some("down".into())).await;

    let response = app.get("/live").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "postline");
}
