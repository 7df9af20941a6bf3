//! Cooperative backoff after the provider answers 429.
//!
//! The provider enforces its rate limit per API key, so one gate is shared
//! by every caller. After a 429 the gate holds all callers until the
//! provider's retry-after has passed; the limit clears only by time.
//! Retry-after values are capped at [`MAX_RETRY_AFTER`].

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use chrono::DateTime;
use parking_lot::Mutex;
use postline_core::Clock;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Cooldown applied when a 429 carries no usable retry-after.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest cooldown a single 429 can impose.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(15 * 60);

/// Shared rate-limit state.
#[derive(Debug)]
pub struct RateLimitGate {
    limited_until: Mutex<Option<Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimitGate {
    /// Creates an open gate.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { limited_until: Mutex::new(None), clock }
    }

    /// Records a 429 and starts or extends the cooldown.
    ///
    /// Errors other than [`ProviderError::RateLimited`] are ignored. An
    /// existing longer limit is never shortened. Retry-after values beyond
    /// [`MAX_RETRY_AFTER`] are clamped to it.
    pub fn handle_rate_limit_error(&self, error: &ProviderError) {
        if !matches!(error, ProviderError::RateLimited { .. }) {
            return;
        }

        let requested = error
            .retry_after_header()
            .and_then(|value| parse_retry_after(value, self.clock.now_system()))
            .unwrap_or(DEFAULT_RETRY_AFTER);
        if requested > MAX_RETRY_AFTER {
            warn!(
                requested_secs = requested.as_secs(),
                max_secs = MAX_RETRY_AFTER.as_secs(),
                "provider retry-after clamped"
            );
        }
        let retry_after = requested.min(MAX_RETRY_AFTER);

        let until = self.clock.now() + retry_after;
        let mut limited_until = self.limited_until.lock();
        match *limited_until {
            Some(existing) if existing >= until => {
                debug!("rate limit already extends past new retry-after");
            },
            _ => {
                *limited_until = Some(until);
                warn!(retry_after_secs = retry_after.as_secs(), "provider rate limit engaged");
            },
        }
    }

    /// Whether callers must wait before the next request.
    pub fn is_rate_limited(&self) -> bool {
        self.remaining().is_some()
    }

    /// Time left until the limit clears, or `None` if not limited.
    pub fn remaining(&self) -> Option<Duration> {
        let until = (*self.limited_until.lock())?;
        let now = self.clock.now();
        (now < until).then(|| until - now)
    }

    /// Waits until the limit clears; returns immediately if not limited.
    ///
    /// The delay is computed once and slept through the clock, without
    /// holding the lock.
    pub async fn wait_for_rate_limit(&self) {
        if let Some(delay) = self.remaining() {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            debug!(delay_ms, "waiting out rate limit");
            self.clock.sleep(delay).await;
        }
    }
}

/// Parses a retry-after value given as delta-seconds or an HTTP-date.
///
/// Dates in the past resolve to zero.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let target = SystemTime::from(date);
    Some(target.duration_since(now).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::UNIX_EPOCH};

    use postline_core::TestClock;

    use super::*;

    fn rate_limited(pairs: &[(&str, &str)]) -> ProviderError {
        let headers: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        ProviderError::rate_limited(headers)
    }

    fn gate() -> (RateLimitGate, TestClock) {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_445_412_480));
        (RateLimitGate::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn retry_after_seconds_sets_limit() {
        let (gate, clock) = gate();

        gate.handle_rate_limit_error(&rate_limited(&[("retry-after", "60")]));
        assert!(gate.is_rate_limited());

        clock.advance(Duration::from_secs(61));
        assert!(!gate.is_rate_limited());
        assert_eq!(gate.remaining(), None);
    }

    #[test]
    fn missing_header_defaults_to_sixty_seconds() {
        let (gate, _clock) = gate();

        gate.handle_rate_limit_error(&rate_limited(&[]));

        assert_eq!(gate.remaining(), Some(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn unparseable_header_defaults_to_sixty_seconds() {
        let (gate, _clock) = gate();

        gate.handle_rate_limit_error(&rate_limited(&[("Retry-After", "soon")]));

        assert_eq!(gate.remaining(), Some(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn http_date_is_accepted() {
        let (gate, _clock) = gate();

        // Clock starts at Wed, 21 Oct 2015 07:28:00 GMT.
        gate.handle_rate_limit_error(&rate_limited(&[(
            "Retry-After",
            "Wed, 21 Oct 2015 07:28:30 GMT",
        )]));

        assert_eq!(gate.remaining(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn shorter_limit_does_not_shrink_existing() {
        let (gate, _clock) = gate();

        gate.handle_rate_limit_error(&rate_limited(&[("retry-after", "120")]));
        gate.handle_rate_limit_error(&rate_limited(&[("retry-after", "5")]));

        assert_eq!(gate.remaining(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn huge_retry_after_is_clamped() {
        let (gate, _clock) = gate();

        gate.handle_rate_limit_error(&rate_limited(&[("retry-after", "86400")]));

        assert_eq!(gate.remaining(), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn far_future_http_date_is_clamped() {
        let (gate, _clock) = gate();

        gate.handle_rate_limit_error(&rate_limited(&[(
            "Retry-After",
            "Fri, 01 Jan 2100 00:00:00 GMT",
        )]));

        assert_eq!(gate.remaining(), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn other_errors_are_ignored() {
        let (gate, _clock) = gate();

        gate.handle_rate_limit_error(&ProviderError::server(503, ""));

        assert!(!gate.is_rate_limited());
    }

    #[tokio::test]
    async fn wait_sleeps_exactly_the_remaining_time() {
        let (gate, clock) = gate();
        gate.handle_rate_limit_error(&rate_limited(&[("retry-after", "10")]));
        clock.advance(Duration::from_secs(4));

        gate.wait_for_rate_limit().await;

        assert_eq!(clock.elapsed(), Duration::from_secs(10));
        assert_eq!(clock.sleep_count(), 1);
        assert!(!gate.is_rate_limited());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_open() {
        let (gate, clock) = gate();

        gate.wait_for_rate_limit().await;

        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn past_http_date_resolves_to_zero() {
        let now = UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }
}
