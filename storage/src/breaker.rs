//! Per-endpoint circuit breakers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// The lowest permitted reset timeout.
pub const MIN_RESET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { open_until: Instant },
    /// one probe is in flight; everyone else is turned away
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

/// A circuit breaker guarding one endpoint.
///
/// Closed by default.
/// After `failure_threshold` consecutive failures the breaker opens
/// for `reset_timeout`;
/// the first attempt past the deadline runs as a half-open probe,
/// whose outcome closes or re-opens the circuit.
///
/// All state lives behind a mutex;
/// the breaker is shared freely between tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Create a breaker with the given threshold (at least 1)
    /// and reset timeout (at least [`MIN_RESET_TIMEOUT`]);
    /// out-of-range values are brought into range.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        let threshold = failure_threshold.max(1);
        if threshold != failure_threshold {
            warn!("circuit breaker threshold raised to {}", threshold);
        }
        let timeout = reset_timeout.max(MIN_RESET_TIMEOUT);
        if timeout != reset_timeout {
            warn!("circuit breaker reset timeout raised to {:?}", timeout);
        }
        CircuitBreaker {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            failure_threshold: threshold,
            reset_timeout: timeout,
        }
    }

    /// Ask for permission to attempt the endpoint.
    ///
    /// Returns how long to wait before retrying
    /// when the circuit is open
    /// or a half-open probe is already in flight.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { open_until } => {
                let now = Instant::now();
                if now < open_until {
                    Err(open_until - now)
                } else {
                    debug!("circuit breaker half-open, allowing one probe");
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                }
            }
            BreakerState::HalfOpen => Err(self.reset_timeout),
        }
    }

    /// Record a successful attempt:
    /// closes the circuit and resets the failure counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            debug!("circuit breaker closing after success");
        }
        inner.state = BreakerState::Closed;
    }

    /// Record a failed attempt:
    /// opens the circuit once the threshold is reached,
    /// and re-opens it after a failed half-open probe.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let reopen = matches!(inner.state, BreakerState::HalfOpen);
        if reopen || inner.consecutive_failures >= self.failure_threshold {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                "circuit breaker opening for {:?}", self.reset_timeout
            );
            inner.state = BreakerState::Open {
                open_until: Instant::now() + self.reset_timeout,
            };
        }
    }

    /// Whether the circuit currently refuses attempts.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => true,
            BreakerState::Open { open_until } => Instant::now() < open_until,
        }
    }

    /// Force the circuit open, as if the threshold had been reached.
    pub fn trip(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = self.failure_threshold;
        inner.state = BreakerState::Open {
            open_until: Instant::now() + self.reset_timeout,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(threshold, Duration::from_secs(5))
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3);
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        assert!(breaker.is_open());
        let wait = breaker.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_secs(5));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let breaker = breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        breaker.record_failure();
        assert!(breaker.is_open());

        // force the deadline into the past
        {
            let mut inner = breaker.inner.lock().unwrap();
            inner.state = BreakerState::Open {
                open_until: Instant::now() - Duration::from_millis(1),
            };
        }

        // one probe passes, the next caller is turned away
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());

        // probe success closes the circuit
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens_the_circuit() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        breaker.record_failure();
        {
            let mut inner = breaker.inner.lock().unwrap();
            inner.state = BreakerState::Open {
                open_until: Instant::now() - Duration::from_millis(1),
            };
        }
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn enforces_minimum_configuration() {
        let breaker = CircuitBreaker::new(0, Duration::from_millis(1));
        assert_eq!(breaker.failure_threshold, 1);
        assert_eq!(breaker.reset_timeout, MIN_RESET_TIMEOUT);
    }
}
