//! Time abstraction for deterministic breaker, rate-limit and replay checks.
//!
//! Every time-dependent decision in Postline (circuit breaker cooldowns,
//! rate-limit windows, webhook timestamp freshness, dedupe windows, backoff
//! sleeps) reads time through [`Clock`]. Production code injects
//! [`RealClock`]; tests inject [`TestClock`] and move time explicitly.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Suspends the caller for `duration`.
    ///
    /// Only the awaiting task is suspended. Dropping the returned future
    /// cancels the sleep.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Wall-clock time as whole seconds since the Unix epoch.
    fn unix_seconds(&self) -> i64 {
        self.now_utc().timestamp()
    }
}

/// Production clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Monotonic time only moves forward through [`TestClock::advance`] (or
/// [`Clock::sleep`], which advances instead of waiting). Wall-clock time
/// follows the same advances and can additionally be set with
/// [`TestClock::set_unix_seconds`], which leaves monotonic time untouched.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct TestClock {
    base_instant: Instant,
    elapsed_ns: Arc<AtomicU64>,
    wall_ns: Arc<AtomicI64>,
    sleeps: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock whose wall clock starts at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            base_instant: Instant::now(),
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_ns: Arc::new(AtomicI64::new(system_time_to_ns(start))),
            sleeps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ns.fetch_add(i64::try_from(ns).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Sets wall-clock time; monotonic time is unaffected.
    pub fn set_unix_seconds(&self, seconds: i64) {
        self.wall_ns.store(seconds.saturating_mul(1_000_000_000), Ordering::Release);
    }

    /// Total monotonic time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Number of `sleep` calls made against this clock.
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::Acquire)
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        let ns = self.wall_ns.load(Ordering::Acquire);
        if ns >= 0 {
            UNIX_EPOCH + Duration::from_nanos(ns.unsigned_abs())
        } else {
            UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
        }
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.fetch_add(1, Ordering::AcqRel);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn system_time_to_ns(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(90));
        assert_eq!(clock.now_system(), start + Duration::from_secs(90));
        assert_eq!(clock.unix_seconds(), 1_700_000_090);
    }

    #[test]
    fn setting_wall_clock_leaves_monotonic_alone() {
        let clock = TestClock::new();
        clock.set_unix_seconds(2_000);

        assert_eq!(clock.unix_seconds(), 2_000);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(5)).await;
        clock.sleep(Duration::from_millis(250)).await;

        assert_eq!(clock.elapsed(), Duration::from_millis(5_250));
        assert_eq!(clock.sleep_count(), 2);
    }

    #[test]
    fn clones_share_state() {
        let clock = TestClock::new();
        let other = clock.clone();

        other.advance(Duration::from_secs(3));

        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }
}
