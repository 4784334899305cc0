//! Circuit breaker guarding the MQTT publish path, adapted from the
//! teacher's `CircuitBreakerBehavior` trait: object-safe, `Send + Sync`,
//! tracked per dependency name so the broker and the database can fail
//! independently without one tripping the other.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
}

/// Object-safe so a `Coordinator` can hold `Arc<dyn CircuitBreakerBehavior>`
/// without committing to a concrete implementation in tests.
pub trait CircuitBreakerBehavior: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self);
    fn record_failure(&self);
    fn is_healthy(&self) -> bool {
        matches!(self.state(), CircuitState::Closed)
    }
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    opened_at: Option<Instant>,
}

/// A classic closed/open/half-open breaker: trips after `failure_threshold`
/// consecutive failures, relaxes to half-open after `reset_timeout`, and
/// a single success from half-open closes it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                success_count: 0,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    fn maybe_relax(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_relax(&mut inner);
        inner.state
    }

    fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_relax(&mut inner);
        !matches!(inner.state, CircuitState::Open)
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    fn force_closed(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

/// Exponential backoff with a cap, used for reconnect loops (MQTT, DB pool
/// warmup). Not jittered: callers that need jitter add it themselves via
/// `fastrand`, since only the MQTT reconnect path currently wants it.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_object_safe(_: &dyn CircuitBreakerBehavior) {}

    #[test]
    fn compiles_as_trait_object() {
        let breaker = CircuitBreaker::new("mqtt", 3, Duration::from_secs(30));
        assert_object_safe(&breaker);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("mqtt", 3, Duration::from_secs(30));
        assert!(breaker.should_allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow());
    }

    #[test]
    fn success_resets_failure_count_and_closes() {
        let breaker = CircuitBreaker::new("db", 2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn backoff_grows_then_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(20, base, max), max);
    }
}
