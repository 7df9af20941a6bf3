//! Shared fixture: the full router over an in-memory store and a test clock.

#![allow(dead_code)]

use std::{
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use postline_api::{
    alert::RecordingAlerter,
    create_router,
    crypto::{sign, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    ingest::{IngestConfig, StaticSecret},
    server::ServerOptions,
    AppState, MailService, WebhookIngestor,
};
use postline_core::{storage::mock::MockStatusStore, Clock, TestClock};
use postline_resilience::{
    CircuitBreaker, CircuitConfig, ClientConfig, ProviderClient, RateLimitGate, RetryExecutor,
};
use serde_json::Value;
use tower::ServiceExt;

pub const SECRET: &str = "whsec_test";
pub const START_UNIX: u64 = 1_700_000_040;

pub struct TestApp {
    pub router: Router,
    pub store: MockStatusStore,
    pub clock: TestClock,
    pub alerter: Arc<RecordingAlerter>,
    pub state: AppState,
}

pub struct Builder {
    config: IngestConfig,
    secret: StaticSecret,
    options: ServerOptions,
    provider_url: Option<String>,
}

impl Builder {
    pub fn ingest_config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = StaticSecret::new(secret);
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.options.max_body_bytes = max;
        self
    }

    /// Enables the `/mail` routes against a provider at `base_url`.
    pub fn provider(mut self, base_url: String) -> Self {
        self.provider_url = Some(base_url);
        self
    }

    pub fn build(self) -> TestApp {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(START_UNIX));
        let store = MockStatusStore::with_clock(Arc::new(clock.clone()));
        let alerter = Arc::new(RecordingAlerter::new());

        let ingestor = Arc::new(WebhookIngestor::new(
            Arc::new(store.clone()),
            Arc::new(self.secret),
            alerter.clone(),
            Arc::new(clock.clone()),
            self.config,
        ));
        let breaker =
            Arc::new(CircuitBreaker::new(CircuitConfig::default(), Arc::new(clock.clone())));
        let gate = Arc::new(RateLimitGate::new(Arc::new(clock.clone())));
        let mut state =
            AppState::new(ingestor, breaker.clone(), gate.clone(), Arc::new(clock.clone()));

        if let Some(base_url) = self.provider_url {
            let executor = Arc::new(RetryExecutor::new(breaker, gate, Arc::new(clock.clone())));
            let config = ClientConfig {
                base_url,
                api_key: "test_key".to_string(),
                timeout: Duration::from_secs(5),
                ..ClientConfig::default()
            };
            let client = ProviderClient::new(config, executor).expect("valid client config");
            let mail = MailService::new(client, Arc::new(store.clone()), Arc::new(clock.clone()));
            state = state.with_mail(Arc::new(mail));
        }

        TestApp {
            router: create_router(state.clone(), self.options),
            store,
            clock,
            alerter,
            state,
        }
    }
}

pub fn builder() -> Builder {
    Builder {
        config: IngestConfig::default(),
        secret: StaticSecret::new(SECRET),
        options: ServerOptions::default(),
        provider_url: None,
    }
}

pub fn app() -> TestApp {
    builder().build()
}

impl TestApp {
    pub fn now_unix(&self) -> String {
        self.clock.unix_seconds().to_string()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.expect("router is infallible")
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()).await
    }

    /// Posts `body` signed with the test secret at the current clock time.
    pub async fn deliver(&self, body: &Value) -> Response<Body> {
        let raw = serde_json::to_vec(body).unwrap();
        let timestamp = self.now_unix();
        let signature = sign(SECRET, &timestamp, &raw).unwrap();
        self.post_raw(raw, Some(&signature), Some(&timestamp)).await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        self.send(request).await
    }

    pub async fn post_raw(
        &self,
        body: Vec<u8>,
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Response<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri("/webhooks/provider")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        if let Some(timestamp) = timestamp {
            request = request.header(TIMESTAMP_HEADER, timestamp);
        }
        self.send(request.body(Body::from(body)).unwrap()).await
    }
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response body should be JSON")
}

/// A provider event for a letter moving to `status`.
pub fn letter_event(id: &str, status: &str) -> Value {
    serde_json::json!({
        "id": format!("evt_{id}_{status}"),
        "object": "event",
        "date_created": "2026-10-18T12:00:00.000Z",
        "event_type": {
            "id": format!("letter.{status}"),
            "resource": "letters",
            "object": "event_type"
        },
        "body": {
            "id": id,
            "object": "letter",
            "status": status,
            "tracking_number": "9400100000000000000001"
        }
    })
}
