//! HTTP client for the mail provider API.
//!
//! Thin `reqwest` wrapper: inputs are validated locally, every call runs
//! through the shared [`RetryExecutor`] with its operation's policy, and
//! responses are classified into [`ProviderError`] kinds for retry and
//! circuit-breaker decisions. Fields beyond the ones used here are carried
//! opaquely as JSON.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use postline_core::ExternalId;
use reqwest::{header::HeaderMap, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    circuit::CircuitBreaker,
    error::{ProviderError, Result},
    rate_limit::RateLimitGate,
    retry::{RetryExecutor, RetryPolicy},
};

/// Longest response body kept in error values.
const MAX_ERROR_BODY: usize = 1024;

/// Configuration for the provider client.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the provider API, without trailing slash.
    pub base_url: String,
    /// API key, sent as the basic-auth user name.
    pub api_key: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.lob.com/v1".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("postline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[redacted]")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Postal address submitted for verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressInput {
    /// Street line.
    pub primary_line: String,
    /// Apartment, suite or unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_line: Option<String>,
    /// City.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Two-letter state code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// ZIP code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
}

impl AddressInput {
    fn validate(&self) -> Result<()> {
        if self.primary_line.trim().is_empty() {
            return Err(ProviderError::validation("primary_line is required"));
        }
        let has_city_state = present(self.city.as_deref()) && present(self.state.as_deref());
        if !has_city_state && !present(self.zip_code.as_deref()) {
            return Err(ProviderError::validation("either city and state or zip_code is required"));
        }
        Ok(())
    }
}

/// Provider verdict on an address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressVerification {
    /// Provider verification id.
    #[serde(default)]
    pub id: Option<String>,
    /// Deliverability classification as reported by the provider.
    pub deliverability: String,
    /// Remaining response fields.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Request for a price quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRequest {
    /// Mail product, for example `letter` or `postcard`.
    pub mail_type: String,
    /// Number of pieces.
    pub quantity: u32,
    /// Provider-specific options passed through unchanged.
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

impl CostRequest {
    fn validate(&self) -> Result<()> {
        if self.mail_type.trim().is_empty() {
            return Err(ProviderError::validation("mail_type is required"));
        }
        if self.quantity == 0 {
            return Err(ProviderError::validation("quantity must be at least 1"));
        }
        Ok(())
    }
}

/// Provider price quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Quoted total, as the provider formats it.
    pub total_cost: Value,
    /// Remaining response fields.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Request to create a physical mail piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMailRequest {
    /// Recipient address, as an address id or inline object.
    pub to: Value,
    /// Sender address, as an address id or inline object.
    pub from: Value,
    /// Document to print: URL or template id.
    pub file: String,
    /// Free-form description shown in the provider dashboard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Provider-specific options passed through unchanged.
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
    /// Key that makes retried creations safe; sent as a header.
    #[serde(skip)]
    pub idempotency_key: String,
}

impl CreateMailRequest {
    /// Creates a request with a fresh idempotency key.
    pub fn new(to: Value, from: Value, file: impl Into<String>) -> Self {
        Self {
            to,
            from,
            file: file.into(),
            description: None,
            options: HashMap::new(),
            idempotency_key: Uuid::new_v4().to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.to.is_null() {
            return Err(ProviderError::validation("recipient address is required"));
        }
        if self.from.is_null() {
            return Err(ProviderError::validation("sender address is required"));
        }
        if self.file.trim().is_empty() {
            return Err(ProviderError::validation("file is required"));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(ProviderError::validation("idempotency key is required"));
        }
        Ok(())
    }
}

/// Mail piece as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailObject {
    /// Provider identifier.
    pub id: ExternalId,
    /// Latest provider status, when reported.
    #[serde(default)]
    pub status: Option<String>,
    /// Carrier tracking number, once assigned.
    #[serde(default)]
    pub tracking_number: Option<String>,
    /// Remaining response fields.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Client for the provider API.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    config: ClientConfig,
    executor: Arc<RetryExecutor>,
}

impl ProviderClient {
    /// Creates a client whose calls share `executor`'s breaker and gate.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Configuration` if the base URL or API key is
    /// missing or the HTTP client cannot be built.
    pub fn new(config: ClientConfig, executor: Arc<RetryExecutor>) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ProviderError::configuration("provider base URL is required"));
        }
        if config.api_key.trim().is_empty() {
            return Err(ProviderError::configuration("provider API key is required"));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                ProviderError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { http, config, executor })
    }

    /// Shared circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.executor.breaker()
    }

    /// Shared rate-limit gate.
    pub fn rate_limit(&self) -> &Arc<RateLimitGate> {
        self.executor.rate_limit()
    }

    /// Verifies a US address.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Validation` for incomplete input without
    /// contacting the provider, otherwise the classified provider failure.
    pub async fn verify_address(&self, address: &AddressInput) -> Result<AddressVerification> {
        address.validate()?;
        let body = to_body(address)?;
        self.call(
            "verify_address",
            &RetryPolicy::address_validation(),
            Method::POST,
            "/us_verifications",
            Some(&body),
            None,
        )
        .await
    }

    /// Requests a price quote.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Validation` for bad input, otherwise the
    /// classified provider failure.
    pub async fn calculate_cost(&self, request: &CostRequest) -> Result<CostEstimate> {
        request.validate()?;
        let body = to_body(request)?;
        self.call(
            "calculate_cost",
            &RetryPolicy::cost_calculation(),
            Method::POST,
            "/costs",
            Some(&body),
            None,
        )
        .await
    }

    /// Creates a mail piece.
    ///
    /// Every attempt carries the same `Idempotency-Key`, so a retry after a
    /// lost response does not create a second piece.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Validation` for bad input, otherwise the
    /// classified provider failure.
    pub async fn create_mail_object(&self, request: &CreateMailRequest) -> Result<MailObject> {
        request.validate()?;
        let body = to_body(request)?;
        self.call(
            "create_mail_object",
            &RetryPolicy::object_creation(),
            Method::POST,
            "/letters",
            Some(&body),
            Some(&request.idempotency_key),
        )
        .await
    }

    /// Fetches the current state of a mail piece.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Validation` for a malformed id, otherwise
    /// the classified provider failure.
    pub async fn fetch_status(&self, external_id: &ExternalId) -> Result<MailObject> {
        let id = external_id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(ProviderError::validation("malformed mail object id"));
        }
        let path = format!("/letters/{id}");
        self.call("fetch_status", &RetryPolicy::status_retrieval(), Method::GET, &path, None, None)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        self.executor
            .execute_with_retry(operation, policy, || {
                self.send(method.clone(), path, body, idempotency_key)
            })
            .await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let span = info_span!("provider_request", method = %method, path = %path);

        async move {
            let start = std::time::Instant::now();
            let mut request = self
                .http
                .request(method, &url)
                .basic_auth(&self.config.api_key, None::<&str>);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }

            let response = request.send().await.map_err(|e| {
                warn!(error = %e, "provider request failed");
                self.transport_error(&e)
            })?;

            let status = response.status();
            let headers = extract_headers(response.headers());
            let bytes = response.bytes().await.map_err(|e| self.transport_error(&e))?;

            debug!(
                status = status.as_u16(),
                duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                "provider responded"
            );

            classify(status, headers, &bytes)
        }
        .instrument(span)
        .await
    }

    fn transport_error(&self, error: &reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
            ProviderError::timeout(timeout_ms)
        } else if error.is_connect() {
            ProviderError::network(format!("connection failed: {error}"))
        } else {
            ProviderError::network(error.to_string())
        }
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ProviderError::validation(e.to_string()))
}

fn present(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

fn classify<T: DeserializeOwned>(
    status: StatusCode,
    headers: HashMap<String, String>,
    body: &[u8],
) -> Result<T> {
    if status.is_success() {
        return serde_json::from_slice(body).map_err(|e| ProviderError::decode(e.to_string()));
    }

    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited { status_code: code, headers });
    }

    let text = truncate_body(body);
    if status.is_server_error() {
        Err(ProviderError::server(code, text))
    } else {
        Err(ProviderError::client(code, text))
    }
}

fn truncate_body(body: &[u8]) -> String {
    if body.len() > MAX_ERROR_BODY {
        format!("{}... (truncated)", String::from_utf8_lossy(&body[..MAX_ERROR_BODY]))
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// Extracts headers from a reqwest `HeaderMap`, dropping non-UTF-8 values.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}
