//! Circuit breaker for the remote PMS adapter.
//!
//! Expressed as an explicit finite state machine {Closed, Open, HalfOpen}
//! with pure transition functions taking the current time, so cooldown
//! behavior is testable without sleeping. The check-and-admit step and the
//! failure/success counters are updated under one lock, so a burst of
//! requests cannot slip through exactly as the failure threshold is crossed.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before permitting one trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial call is outstanding.
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Proceed,
    Success,
    Failure,
}

/// Pure transition function: `(state, event, now) -> (state, admitted)`.
fn transition(inner: Inner, event: Event, now: Instant, config: &CircuitBreakerConfig) -> (Inner, bool) {
    let mut next = inner;
    let admitted = match (inner.state, event) {
        (CircuitState::Closed, Event::Proceed) => true,
        (CircuitState::Open, Event::Proceed) => {
            let cooled = inner
                .opened_at
                .map(|t| now.duration_since(t) >= config.cooldown)
                .unwrap_or(true);
            if cooled {
                next.state = CircuitState::HalfOpen;
                next.trial_in_flight = true;
                true
            } else {
                false
            }
        }
        // exactly one trial call while half-open
        (CircuitState::HalfOpen, Event::Proceed) => {
            if inner.trial_in_flight {
                false
            } else {
                next.trial_in_flight = true;
                true
            }
        }
        (CircuitState::Closed, Event::Success) => {
            next.consecutive_failures = 0;
            true
        }
        (CircuitState::HalfOpen, Event::Success) => {
            // trial succeeded: fully close
            next.state = CircuitState::Closed;
            next.consecutive_failures = 0;
            next.opened_at = None;
            next.trial_in_flight = false;
            true
        }
        (CircuitState::Closed, Event::Failure) => {
            next.consecutive_failures = inner.consecutive_failures + 1;
            if next.consecutive_failures >= config.failure_threshold {
                next.state = CircuitState::Open;
                next.opened_at = Some(now);
            }
            true
        }
        (CircuitState::HalfOpen, Event::Failure) => {
            // trial failed: re-open and restart the cooldown clock
            next.state = CircuitState::Open;
            next.opened_at = Some(now);
            next.trial_in_flight = false;
            true
        }
        (CircuitState::Open, Event::Success | Event::Failure) => true,
    };
    (next, admitted)
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Atomically decide whether a call may go upstream right now.
    pub fn proceed(&self) -> bool {
        self.proceed_at(Instant::now())
    }

    pub fn proceed_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let (next, admitted) = transition(*inner, Event::Proceed, now, &self.config);
        *inner = next;
        admitted
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let (next, _) = transition(*inner, Event::Success, now, &self.config);
        *inner = next;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let (next, _) = transition(*inner, Event::Failure, now, &self.config);
        *inner = next;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker();
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.proceed_at(now));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker();
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        cb.record_success_at(now);
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_cooldown_permits_exactly_one_trial() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }

        let before_cooldown = now + Duration::from_secs(59);
        assert!(!cb.proceed_at(before_cooldown));

        let after_cooldown = now + Duration::from_secs(60);
        assert!(cb.proceed_at(after_cooldown));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // second caller during the trial is refused
        assert!(!cb.proceed_at(after_cooldown));
    }

    #[test]
    fn test_trial_success_fully_closes() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }

        let later = now + Duration::from_secs(61);
        assert!(cb.proceed_at(later));
        cb.record_success_at(later);
        assert_eq!(cb.state(), CircuitState::Closed);

        // and the failure counter starts fresh
        cb.record_failure_at(later);
        cb.record_failure_at(later);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_failure_reopens_and_resets_clock() {
        let cb = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(start);
        }

        let trial_time = start + Duration::from_secs(60);
        assert!(cb.proceed_at(trial_time));
        cb.record_failure_at(trial_time);
        assert_eq!(cb.state(), CircuitState::Open);

        // the cooldown restarts from the trial failure, not the first open
        assert!(!cb.proceed_at(trial_time + Duration::from_secs(59)));
        assert!(cb.proceed_at(trial_time + Duration::from_secs(60)));
    }
}
