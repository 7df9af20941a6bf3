//! Resilient outbound calls to the mail provider.
//!
//! Every provider call goes through one [`RetryExecutor`] that shares a
//! single [`CircuitBreaker`] and a single [`RateLimitGate`]:
//!
//! 1. **Rate limit** - wait out any cooldown from a previous 429
//! 2. **Circuit check** - fail fast with `CircuitOpen` while the provider is
//!    considered down
//! 3. **Call** - issue the HTTP request with a per-attempt timeout
//! 4. **Classify** - map the outcome to a [`ProviderError`] kind, feed the
//!    breaker and the gate, and back off before retrying
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postline_core::{Clock, RealClock};
//! use postline_resilience::{
//!     circuit::{CircuitBreaker, CircuitConfig},
//!     client::{ClientConfig, ProviderClient},
//!     rate_limit::RateLimitGate,
//!     retry::RetryExecutor,
//!     ProviderError,
//! };
//!
//! # async fn example() -> Result<(), ProviderError> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let breaker = Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone()));
//! let gate = Arc::new(RateLimitGate::new(clock.clone()));
//! let executor = Arc::new(RetryExecutor::new(breaker, gate, clock));
//!
//! let config = ClientConfig { api_key: "test_key".into(), ..ClientConfig::default() };
//! let client = ProviderClient::new(config, executor)?;
//! let letter = client.fetch_status(&"ltr_123".into()).await?;
//! println!("{:?}", letter.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod error;
pub mod rate_limit;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use client::{ClientConfig, ProviderClient};
pub use error::{ErrorCategory, ProviderError, Result};
pub use rate_limit::RateLimitGate;
pub use retry::{retry_with_backoff, RetryExecutor, RetryPolicy};

/// Default per-attempt provider request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
