//! Circuit breaker guarding one provider adapter.
//!
//! Closed → Open after N consecutive breaker-class failures
//! (transport, 5xx, overload). Open → HalfOpen after the cooldown.
//! HalfOpen → Closed on one success, → Open with doubled cooldown on
//! one failure.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// One trial request is allowed through
    HalfOpen,
}

impl BreakerState {
    /// Stable string form for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
}

/// Three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        threshold: u32,
        base_cooldown: Duration,
        max_cooldown: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            base_cooldown,
            max_cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: base_cooldown,
            }),
        }
    }

    /// Checks whether a request may proceed.
    ///
    /// Transitions Open → HalfOpen once the cooldown elapses.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown when the circuit is open.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= inner.cooldown {
                    debug!(provider = %self.name, "circuit half-open after cooldown");
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(inner.cooldown - elapsed)
                }
            }
        }
    }

    /// Records a successful round trip.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.state != BreakerState::Closed {
            debug!(provider = %self.name, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cooldown = self.base_cooldown;
    }

    /// Records a breaker-class failure (transport, 5xx, overload).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.state {
            BreakerState::HalfOpen => {
                // The trial failed; reopen with a longer cooldown.
                inner.cooldown = (inner.cooldown * 2).min(self.max_cooldown);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    provider = %self.name,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "circuit re-opened after half-open failure"
                );
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        provider = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state, transitioning Open → HalfOpen if cooled down.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            threshold,
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let b = breaker(3);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker(3);
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());
    }

    #[test]
    fn test_success_resets_counter() {
        let b = breaker(3);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let b = breaker(1);
        b.record_failure();
        assert!(b.check().is_err());

        std::thread::sleep(Duration::from_millis(60));
        // Cooldown elapsed: one trial allowed.
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_doubles_cooldown() {
        let b = breaker(1);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.check().is_ok()); // half-open

        b.record_failure(); // reopen with doubled cooldown (100ms)
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        // Only 60ms elapsed of a 100ms cooldown: still open.
        assert!(b.check().is_err());

        std::thread::sleep(Duration::from_millis(50));
        assert!(b.check().is_ok());
    }
}
