//! Circuit breaker for the object store.
//!
//! A run can walk thousands of partitions. When the store keeps failing
//! (throttling, 5xx or connection errors) the breaker opens and the
//! remaining partitions fail fast with `FetchError::CircuitOpen` until the
//! cooldown expires.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Closed,
    Open { since: Instant },
}

#[derive(Debug)]
struct State {
    mode: Mode,
    consecutive_failures: u32,
}

/// Refuses requests for a cooldown period after repeated failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                mode: Mode::Closed,
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Default for the object store: open after 5 consecutive failures, 5-minute cooldown.
    pub fn for_object_store() -> Self {
        Self::new(5, Duration::from_secs(5 * 60))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a request may be sent now. An expired cooldown closes the breaker.
    pub fn is_allowed(&self) -> bool {
        let mut state = self.lock();
        match state.mode {
            Mode::Closed => true,
            Mode::Open { since } if since.elapsed() >= self.cooldown => {
                state.mode = Mode::Closed;
                state.consecutive_failures = 0;
                true
            }
            Mode::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold && state.mode == Mode::Closed {
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "object store circuit breaker opened"
            );
            state.mode = Mode::Open {
                since: Instant::now(),
            };
        }
    }

    /// Time left before requests are allowed again (zero when closed).
    pub fn remaining_cooldown(&self) -> Duration {
        match self.lock().mode {
            Mode::Closed => Duration::ZERO,
            Mode::Open { since } => self.cooldown.saturating_sub(since.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(cb.is_allowed());
        assert_eq!(cb.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn opens_at_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_allowed());
        cb.record_failure();
        assert!(!cb.is_allowed());
        assert!(cb.remaining_cooldown() > Duration::ZERO);
    }

    #[test]
    fn success_resets_the_count() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.is_allowed());
    }

    #[test]
    fn cooldown_closes_the_breaker() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert!(!cb.is_allowed());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
    }
}
