//! Outbound mail endpoint tests against a stubbed provider.

mod common;

use axum::http::{header, StatusCode};
use common::{app, builder, json_body};
use postline_core::{ExternalId, MailStatus, StatusStore};
use serde_json::json;
use wiremock::{
    matchers::{header as header_eq, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn letter_body() -> serde_json::Value {
    json!({
        "to": "adr_to",
        "from": "adr_from",
        "file": "https://files.test/doc.pdf",
        "color": false
    })
}

#[tokio::test]
async fn created_letter_is_tracked_for_webhooks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/letters"))
        .and(header_eq("idempotency-key", "order-42"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "ltr_42", "status": "processed_for_delivery"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let app = builder().provider(server.uri()).build();

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/mail/letters")
        .header("content-type", "application/json")
        .header("idempotency-key", "order-42")
        .body(axum::body::Body::from(serde_json::to_vec(&letter_body()).unwrap()))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["id"], "ltr_42");

    let piece = app.store.find_mail_piece(&ExternalId::new("ltr_42")).await.unwrap().unwrap();
    assert_eq!(piece.status, MailStatus::InLocalArea);
}

#[tokio::test]
async fn mail_routes_refuse_without_provider() {
    let app = app();

    let response = app.post_json("/mail/letters", &letter_body()).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "PROVIDER_NOT_CONFIGURED");
}

#[tokio::test]
async fn provider_throttling_is_passed_on() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/us_verifications"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "600"))
        .expect(1)
        .mount(&server)
        .await;
    let app = builder().provider(server.uri()).build();

    let response = app
        .post_json(
            "/mail/address-verifications",
            &json!({"primary_line": "185 Berry St", "zip_code": "94107"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "600");
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert!(app.state.rate_limit.is_rate_limited());
}

#[tokio::test]
async fn invalid_cost_request_is_rejected_locally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let app = builder().provider(server.uri()).build();

    let response =
        app.post_json("/mail/costs", &json!({"mail_type": "letter", "quantity": 0})).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn letter_status_is_fetched_from_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/letters/ltr_7"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "ltr_7", "status": "in_transit"})),
        )
        .mount(&server)
        .await;
    let app = builder().provider(server.uri()).build();

    let response = app.get("/mail/letters/ltr_7").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "in_transit");
}
