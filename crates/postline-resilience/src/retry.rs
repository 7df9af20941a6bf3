//! Retry with exponential backoff and jitter.
//!
//! [`RetryExecutor`] wraps every outbound provider call: it waits out an
//! active rate limit, fails fast when the shared circuit breaker is open,
//! feeds call outcomes back into the breaker and the rate-limit gate, and
//! sleeps between attempts according to the call site's [`RetryPolicy`].
//!
//! [`retry_with_backoff`] is the same backoff loop without the breaker and
//! gate hooks, for retrying local operations such as persistence.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use postline_core::Clock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    circuit::CircuitBreaker,
    error::{ErrorCategory, ProviderError, Result},
    rate_limit::RateLimitGate,
};

/// Retry policy for one kind of operation.
///
/// Immutable once built; each call site picks the preset matching its
/// operation. The delay before retry `k` (1-based) is
/// `min(base_delay * 2^(k-1), max_delay)`. With jitter enabled an extra
/// amount drawn uniformly from `[0, delay)` is added on top.
pub struct RetryPolicy<E = ProviderError> {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the exponential delay, applied before jitter.
    pub max_delay: Duration,
    /// Whether to add random jitter to each delay.
    pub jitter: bool,
    /// Decides whether a failure may be retried.
    pub retry_condition: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E> {
    /// Creates a jittered policy.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        retry_condition: fn(&E) -> bool,
    ) -> Self {
        Self { max_retries, base_delay, max_delay, jitter: true, retry_condition }
    }

    /// Same policy with jitter disabled.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Same timing applied to a different error type.
    pub fn with_retry_condition<F>(self, retry_condition: fn(&F) -> bool) -> RetryPolicy<F> {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            retry_condition,
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether `error` may be retried under this policy.
    pub fn should_retry(&self, error: &E) -> bool {
        (self.retry_condition)(error)
    }

    /// Capped exponential delay before retry `retry` (1-based), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry `retry` (1-based), with jitter if enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if self.jitter {
            delay + jitter_below(delay)
        } else {
            delay
        }
    }

    /// Upper bound on the total time a call under this policy can take.
    ///
    /// Every attempt runs to its timeout, every delay receives maximal
    /// jitter, and each attempt may additionally wait up to `max_delay` for
    /// a rate-limit cooldown.
    pub fn worst_case_duration(&self, per_attempt_timeout: Duration) -> Duration {
        self.worst_case_from(per_attempt_timeout, 0).saturating_add(self.rate_limit_allowance())
    }

    /// Total time a call may spend waiting on rate-limit cooldowns.
    pub fn rate_limit_allowance(&self) -> Duration {
        self.max_delay.saturating_mul(self.max_attempts())
    }

    /// Worst case for the attempts still to come once `retries_done`
    /// retries have been started.
    fn worst_case_from(&self, per_attempt_timeout: Duration, retries_done: u32) -> Duration {
        let attempts_left = self.max_attempts().saturating_sub(retries_done);
        let attempts = per_attempt_timeout.saturating_mul(attempts_left);
        (retries_done.saturating_add(1)..=self.max_retries).fold(attempts, |total, retry| {
            let delay = self.base_delay_for(retry);
            let delay = if self.jitter { delay.saturating_mul(2) } else { delay };
            total.saturating_add(delay)
        })
    }
}

impl RetryPolicy<ProviderError> {
    /// Address verification: {2 retries, 500ms, 5s}.
    pub fn address_validation() -> Self {
        Self::new(
            2,
            Duration::from_millis(500),
            Duration::from_secs(5),
            ProviderError::is_retryable,
        )
    }

    /// Cost calculation: {3 retries, 1s, 8s}.
    pub fn cost_calculation() -> Self {
        Self::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(8),
            ProviderError::is_retryable,
        )
    }

    /// Mail object creation: {5 retries, 2s, 15s}.
    pub fn object_creation() -> Self {
        Self::new(
            5,
            Duration::from_secs(2),
            Duration::from_secs(15),
            ProviderError::is_retryable,
        )
    }

    /// Status retrieval: {3 retries, 1s, 10s}.
    pub fn status_retrieval() -> Self {
        Self::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
            ProviderError::is_retryable,
        )
    }

    /// Webhook processing: {2 retries, 500ms, 3s}.
    ///
    /// Pair with [`RetryPolicy::with_retry_condition`] to retry local
    /// persistence errors.
    pub fn webhook_processing() -> Self {
        Self::new(
            2,
            Duration::from_millis(500),
            Duration::from_secs(3),
            ProviderError::is_retryable,
        )
    }
}

/// 429 handed back when the gate was engaged by an earlier call.
fn cooldown_error(wait: Duration) -> ProviderError {
    let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    ProviderError::rate_limited(HashMap::from([(
        "retry-after".to_string(),
        seconds.to_string(),
    )]))
}

fn jitter_below(delay: Duration) -> Duration {
    let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

/// Runs provider operations under the shared breaker and rate-limit gate.
///
/// A call never runs longer than its policy's
/// [`worst_case_duration`](RetryPolicy::worst_case_duration) for the
/// executor's per-attempt timeout. Rate-limit cooldowns are waited out only
/// while they fit in what is left of that budget; a longer cooldown fails
/// the call with the 429 instead of stalling it.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    breaker: Arc<CircuitBreaker>,
    gate: Arc<RateLimitGate>,
    clock: Arc<dyn Clock>,
    attempt_timeout: Duration,
}

impl RetryExecutor {
    /// Creates an executor over shared resilience state.
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        gate: Arc<RateLimitGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breaker,
            gate,
            clock,
            attempt_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
        }
    }

    /// Sets the per-attempt timeout used to budget each call.
    ///
    /// Should match the HTTP client's request timeout.
    #[must_use]
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Per-attempt timeout used to budget each call.
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Shared circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Shared rate-limit gate.
    pub fn rate_limit(&self) -> &Arc<RateLimitGate> {
        &self.gate
    }

    /// Runs `operation` until it succeeds, fails non-retryably, or the
    /// policy's retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::CircuitOpen` without calling `operation` when
    /// the breaker blocks, `ProviderError::RateLimited` when the active
    /// cooldown outlasts the call's remaining budget, and otherwise the last
    /// error the operation produced.
    #[instrument(name = "provider_call", skip_all, fields(operation = operation_name))]
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline =
            self.clock.now().checked_add(policy.worst_case_duration(self.attempt_timeout));
        let mut retry = 0;
        let mut last_error: Option<ProviderError> = None;
        loop {
            if let Some(wait) = self.gate.remaining() {
                let reserved = policy.worst_case_from(self.attempt_timeout, retry);
                let resume_by = self.clock.now().checked_add(wait.saturating_add(reserved));
                let fits = match (deadline, resume_by) {
                    (None, _) => true,
                    (Some(deadline), Some(resume_by)) => resume_by <= deadline,
                    (Some(_), None) => false,
                };
                if !fits {
                    warn!(
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "rate limit outlasts call budget, failing fast"
                    );
                    return Err(last_error.unwrap_or_else(|| cooldown_error(wait)));
                }
                self.gate.wait_for_rate_limit().await;
            }
            self.breaker.check().inspect_err(|_| {
                warn!("circuit open, failing fast");
            })?;

            let error = match operation().await {
                Ok(value) => {
                    self.breaker.on_success();
                    if retry > 0 {
                        debug!(attempts = retry + 1, "provider call succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(error) => error,
            };

            if error.counts_toward_breaker() {
                self.breaker.on_failure();
            } else {
                self.breaker.release_trial();
            }
            if matches!(error, ProviderError::RateLimited { .. }) {
                self.gate.handle_rate_limit_error(&error);
            }

            if retry >= policy.max_retries || !policy.should_retry(&error) {
                warn!(
                    attempts = retry + 1,
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "provider call failed"
                );
                return Err(error);
            }

            retry += 1;
            let delay = policy.delay_for(retry);
            warn!(
                retry,
                max_retries = policy.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "provider call failed, retrying"
            );
            last_error = Some(error);
            self.clock.sleep(delay).await;
        }
    }

    /// [`execute_with_retry`](Self::execute_with_retry) that stops when
    /// `token` is cancelled.
    ///
    /// An in-flight attempt or backoff sleep is dropped and
    /// `ProviderError::Cancelled` returned.
    pub async fn execute_with_retry_cancellable<T, F, Fut>(
        &self,
        operation_name: &str,
        policy: &RetryPolicy,
        operation: F,
        token: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(ProviderError::Cancelled),
            result = self.execute_with_retry(operation_name, policy, operation) => result,
        }
    }
}

/// Retries a local operation with the policy's backoff.
///
/// No breaker or rate-limit interaction. Returns the last error once the
/// policy gives up.
pub async fn retry_with_backoff<T, E, F, Fut>(
    clock: &dyn Clock,
    policy: &RetryPolicy<E>,
    mut operation: F,
) -> std::result::Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if retry < policy.max_retries && policy.should_retry(&error) => {
                retry += 1;
                let delay = policy.delay_for(retry);
                warn!(retry, error = %error, "operation failed, retrying");
                clock.sleep(delay).await;
            },
            Err(error) => return Err(error),
        }
    }
}
