//! Error types for outbound provider operations.
//!
//! Every failure of a provider call is classified into one [`ProviderError`]
//! kind. The kind decides whether the call is retried, whether it counts
//! against the shared circuit breaker, and what callers may show to users.

use std::{collections::HashMap, fmt};

use thiserror::Error;

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Generic message for failures the caller cannot act on.
pub const GENERIC_PROVIDER_MESSAGE: &str = "provider request failed";

/// Classified failure of an outbound provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection reset, refused, DNS failure or similar transport error.
    #[error("network error: {message}")]
    Network {
        /// Transport error description
        message: String,
    },

    /// Request exceeded its per-attempt timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured per-attempt timeout in milliseconds
        timeout_ms: u64,
    },

    /// Provider answered 429 Too Many Requests.
    #[error("rate limited by provider: HTTP {status_code}")]
    RateLimited {
        /// HTTP status code (429)
        status_code: u16,
        /// Response headers, used to read retry-after
        headers: HashMap<String, String>,
    },

    /// Provider answered with a 5xx status.
    #[error("provider server error: HTTP {status_code}")]
    Server {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Provider rejected the request with a non-429 4xx status.
    #[error("provider rejected request: HTTP {status_code}")]
    Client {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Caller input failed local validation and was never sent.
    #[error("invalid request: {message}")]
    Validation {
        /// What was wrong with the input
        message: String,
    },

    /// Shared circuit breaker is open; the call was not attempted.
    #[error("circuit breaker open for provider")]
    CircuitOpen,

    /// Provider response body could not be decoded.
    #[error("unexpected provider response: {message}")]
    Decode {
        /// Decoder error description
        message: String,
    },

    /// Client could not be constructed from its configuration.
    #[error("provider client configuration error: {message}")]
    Configuration {
        /// Configuration error description
        message: String,
    },

    /// Call was cancelled before completing.
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a 429 error carrying the response headers.
    pub fn rate_limited(headers: HashMap<String, String>) -> Self {
        Self::RateLimited { status_code: 429, headers }
    }

    /// Creates a 5xx error.
    pub fn server(status_code: u16, body: impl Into<String>) -> Self {
        Self::Server { status_code, body: body.into() }
    }

    /// Creates a 4xx error.
    pub fn client(status_code: u16, body: impl Into<String>) -> Self {
        Self::Client { status_code, body: body.into() }
    }

    /// Creates a local validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failure is temporary and the call may be retried.
    ///
    /// This is the default retry condition: network errors, timeouts, 429
    /// and 5xx. Other 4xx, validation, circuit-open, decode, configuration
    /// and cancellation errors are final.
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    /// Whether the failure counts toward opening the circuit breaker.
    ///
    /// Only provider-health signals count. A 400 caused by bad input says
    /// nothing about provider health.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_transient()
    }

    fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. } => true,

            Self::Client { .. }
            | Self::Validation { .. }
            | Self::CircuitOpen
            | Self::Decode { .. }
            | Self::Configuration { .. }
            | Self::Cancelled => false,
        }
    }

    /// Raw retry-after header value of a 429, if present.
    ///
    /// Looks up `retry-after`, then `Retry-After`, then any header whose
    /// name matches case-insensitively.
    pub fn retry_after_header(&self) -> Option<&str> {
        let Self::RateLimited { headers, .. } = self else {
            return None;
        };

        headers
            .get("retry-after")
            .or_else(|| headers.get("Retry-After"))
            .or_else(|| {
                headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    /// Retry-after of a 429 when given as delta-seconds.
    ///
    /// HTTP-date values are resolved by the rate-limit gate, which knows the
    /// current time.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after_header().and_then(|value| value.trim().parse().ok())
    }

    /// HTTP status code returned by the provider, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status_code, .. }
            | Self::Server { status_code, .. }
            | Self::Client { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Message safe to show to end users.
    ///
    /// Transient failures collapse to [`GENERIC_PROVIDER_MESSAGE`]; no
    /// provider body or transport detail is exposed.
    pub fn user_message(&self) -> String {
        match self {
            _ if self.is_transient() => GENERIC_PROVIDER_MESSAGE.to_string(),
            Self::Validation { message } => message.clone(),
            Self::Client { .. } => "provider rejected the request".to_string(),
            Self::CircuitOpen => "provider temporarily unavailable".to_string(),
            Self::Cancelled => "request cancelled".to_string(),
            _ => GENERIC_PROVIDER_MESSAGE.to_string(),
        }
    }
}

/// Category of provider error for logs and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// Provider rejected the request (4xx).
    Client,
    /// Provider failure (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Circuit breaker protection.
    Circuit,
    /// Caller input.
    Validation,
    /// Unexpected response shape.
    Decode,
    /// Client configuration problems.
    Configuration,
    /// Cancelled by the caller.
    Cancelled,
}

impl From<&ProviderError> for ErrorCategory {
    fn from(error: &ProviderError) -> Self {
        match error {
            ProviderError::Network { .. } | ProviderError::Timeout { .. } => Self::Network,
            ProviderError::Client { .. } => Self::Client,
            ProviderError::Server { .. } => Self::Server,
            ProviderError::RateLimited { .. } => Self::RateLimit,
            ProviderError::CircuitOpen => Self::Circuit,
            ProviderError::Validation { .. } => Self::Validation,
            ProviderError::Decode { .. } => Self::Decode,
            ProviderError::Configuration { .. } => Self::Configuration,
            ProviderError::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::RateLimit => "rate_limit",
            Self::Circuit => "circuit",
            Self::Validation => "validation",
            Self::Decode => "decode",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(ProviderError::network("connection reset").is_retryable());
        assert!(ProviderError::timeout(10_000).is_retryable());
        assert!(ProviderError::server(503, "unavailable").is_retryable());
        assert!(ProviderError::rate_limited(HashMap::new()).is_retryable());

        assert!(!ProviderError::client(400, "bad address").is_retryable());
        assert!(!ProviderError::client(404, "missing").is_retryable());
        assert!(!ProviderError::validation("empty city").is_retryable());
        assert!(!ProviderError::CircuitOpen.is_retryable());
        assert!(!ProviderError::decode("eof").is_retryable());
        assert!(!ProviderError::configuration("bad url").is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn only_provider_health_failures_count_toward_breaker() {
        assert!(ProviderError::server(500, "").counts_toward_breaker());
        assert!(ProviderError::timeout(1).counts_toward_breaker());
        assert!(!ProviderError::client(422, "").counts_toward_breaker());
        assert!(!ProviderError::validation("x").counts_toward_breaker());
    }

    #[test]
    fn retry_after_lookup_order() {
        let lower = ProviderError::rate_limited(headers(&[("retry-after", "5")]));
        assert_eq!(lower.retry_after_seconds(), Some(5));

        let canonical = ProviderError::rate_limited(headers(&[("Retry-After", "7")]));
        assert_eq!(canonical.retry_after_seconds(), Some(7));

        let shouting = ProviderError::rate_limited(headers(&[("RETRY-AFTER", "9")]));
        assert_eq!(shouting.retry_after_seconds(), Some(9));

        let both =
            ProviderError::rate_limited(headers(&[("retry-after", "1"), ("Retry-After", "2")]));
        assert_eq!(both.retry_after_seconds(), Some(1));

        assert_eq!(ProviderError::rate_limited(HashMap::new()).retry_after_seconds(), None);
        assert_eq!(ProviderError::timeout(1).retry_after_seconds(), None);
    }

    #[test]
    fn user_message_hides_transient_detail() {
        let err = ProviderError::server(502, "upstream stack trace");
        assert_eq!(err.user_message(), GENERIC_PROVIDER_MESSAGE);
        assert_eq!(ProviderError::network("dns").user_message(), GENERIC_PROVIDER_MESSAGE);
        assert_eq!(ProviderError::validation("zip code required").user_message(), "zip code required");
    }

    #[test]
    fn status_codes_and_categories() {
        assert_eq!(ProviderError::server(500, "").status_code(), Some(500));
        assert_eq!(ProviderError::rate_limited(HashMap::new()).status_code(), Some(429));
        assert_eq!(ProviderError::network("x").status_code(), None);

        assert_eq!(ErrorCategory::from(&ProviderError::timeout(1)), ErrorCategory::Network);
        assert_eq!(ErrorCategory::from(&ProviderError::CircuitOpen), ErrorCategory::Circuit);
        assert_eq!(ErrorCategory::RateLimit.to_string(), "rate_limit");
    }
}
