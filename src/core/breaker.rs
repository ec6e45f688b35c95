//! Circuit breaker guarding the external ranking model.
//!
//! After `failure_threshold` consecutive failures the breaker opens and the
//! scorer stops calling the model until `reset_timeout` has passed; the next
//! call is then let through as a trial (half-open).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests are allowed.
    Closed,
    /// Requests are rejected.
    Open,
    /// One trial request is allowed.
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    last_state_change: Instant,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
    consecutive_failures: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                last_state_change: Instant::now(),
            }),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// Whether a request should be let through.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= self.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = Instant::now();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.last_state_change = Instant::now();
            tracing::info!("ranking model recovered; circuit closed");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock();
        let trip = match inner.state {
            CircuitState::Closed => failures >= u64::from(self.failure_threshold),
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.last_state_change = Instant::now();
            tracing::warn!(failures, "ranking model circuit opened");
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}
