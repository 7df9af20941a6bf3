//! Circuit breaker protecting the provider from cascading failures.
//!
//! A single breaker is shared by every outbound provider call: the provider
//! is one dependency, so its health is tracked once.
//!
//! # State machine
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │
//!     │ success                        │ open_duration elapsed
//!     │                                │ (checked lazily in can_execute)
//!     │                                ▼
//!     └───────────────────────────  HALF-OPEN
//!                                      │
//!                                      │ failure (threshold still reached)
//!                                      ▼
//!                                    OPEN
//! ```
//!
//! There is no timer: the Open to Half-Open transition is a pure function
//! of the state, the last failure time and the current time, evaluated
//! whenever a caller asks whether it may proceed.
//!
//! Half-Open admits one trial call at a time through [`CircuitBreaker::check`].
//! The trial slot frees when the outcome is recorded, or after
//! `open_duration` if the trial never reports back.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use postline_core::RealClock;
//! use postline_resilience::circuit::{CircuitBreaker, CircuitConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitConfig::default(), Arc::new(RealClock::new()));
//! if breaker.can_execute() {
//!     breaker.on_success();
//! }
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use postline_core::Clock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProviderError, Result};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub open_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_duration: Duration::from_secs(60) }
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls allowed.
    Closed,
    /// Provider considered unhealthy; calls fail fast.
    Open,
    /// Cooldown elapsed; one trial call at a time tests recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of the breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state, with any pending Open to Half-Open transition applied.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Successful calls recorded since creation.
    pub total_successes: u64,
    /// Failed calls recorded since creation.
    pub total_failures: u64,
    /// Calls rejected because the circuit was open.
    pub total_rejections: u64,
    /// Times the circuit has opened.
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    trial_started_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            trial_started_at: None,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            times_opened: 0,
        }
    }
}

/// Thread-safe circuit breaker shared by all provider calls.
///
/// The lock is a `parking_lot::Mutex` and is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, state: Mutex::new(BreakerState::new()), clock }
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Whether a call may proceed now.
    ///
    /// True in Closed and Half-Open. An Open circuit whose cooldown has
    /// elapsed moves to Half-Open here.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.state != CircuitState::Open
    }

    /// Admits a call, failing fast with [`ProviderError::CircuitOpen`] when
    /// blocked.
    ///
    /// In Half-Open only one trial call is admitted; concurrent callers are
    /// rejected until its outcome is recorded.
    pub fn check(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh(&mut state);

        let admitted = match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let trial_pending = state.trial_started_at.is_some_and(|started| {
                    now.saturating_duration_since(started) < self.config.open_duration
                });
                if !trial_pending {
                    state.trial_started_at = Some(now);
                }
                !trial_pending
            },
        };

        if !admitted {
            state.total_rejections += 1;
            return Err(ProviderError::CircuitOpen);
        }
        Ok(())
    }

    /// Frees the Half-Open trial slot for an outcome that says nothing about
    /// provider health.
    pub fn release_trial(&self) {
        self.state.lock().trial_started_at = None;
    }

    /// Records a successful call.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        state.total_successes += 1;
        state.trial_started_at = None;

        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                state.consecutive_failures = 0;
                state.state = CircuitState::Closed;
                info!("provider circuit closed after successful trial call");
            },
            CircuitState::Open => {
                warn!("recorded success for call started before circuit opened");
            },
        }
    }

    /// Records a failed call that reflects provider health.
    pub fn on_failure(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.total_failures += 1;
        state.trial_started_at = None;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_failure_at = Some(now);

                if state.consecutive_failures >= self.config.failure_threshold {
                    let reopened = state.state == CircuitState::HalfOpen;
                    state.state = CircuitState::Open;
                    state.times_opened += 1;
                    let open_for_ms =
                        u64::try_from(self.config.open_duration.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        consecutive_failures = state.consecutive_failures,
                        open_for_ms,
                        reopened,
                        "provider circuit opened"
                    );
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Current state, with any pending Open to Half-Open transition applied.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.state
    }

    /// Copy of the breaker state and lifetime counters.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        CircuitSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            times_opened: state.times_opened,
        }
    }

    fn refresh(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let Some(last_failure_at) = state.last_failure_at else {
            return;
        };
        if self.clock.now().saturating_duration_since(last_failure_at) >= self.config.open_duration
        {
            state.state = CircuitState::HalfOpen;
            state.trial_started_at = None;
            info!("provider circuit half-open, allowing trial call");
        }
    }
}
