use cineforge_common::config::CircuitBreakerConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// Broadcast to interested parties (the lock manager drops its soft state
/// on `Opened`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitEvent {
    Opened,
    HalfOpened,
    Closed,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Failure detector for database connectivity.
///
/// Counts consecutive connectivity/timeout failures; at the threshold the
/// breaker opens for a cool-down window. The first call after the window
/// runs as a half-open probe: success closes the breaker, failure re-opens
/// it.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cool_down: config.cool_down,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            events,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.locked().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Returns whether a call may proceed. While open, the cool-down is
    /// checked and elapsing it moves the breaker to half-open, admitting
    /// exactly this call as the probe.
    pub fn allow_call(&self) -> bool {
        let mut inner = self.locked();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cool_down)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    self.emit(CircuitEvent::HalfOpened);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.locked();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            self.emit(CircuitEvent::Closed);
        }
    }

    /// Records a connectivity failure. Non-connectivity errors (constraint
    /// violations, bad SQL) must not be fed here.
    pub fn record_failure(&self) {
        let mut inner = self.locked();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                self.emit(CircuitEvent::Opened);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "database circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.emit(CircuitEvent::Opened);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn emit(&self, event: CircuitEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    fn breaker(threshold: u32, cool_down: Duration) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            cool_down,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        check!(breaker.state() == CircuitState::Closed);
        breaker.record_failure();
        check!(breaker.state() == CircuitState::Open);
        check!(!breaker.allow_call());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = breaker(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        check!(breaker.state() == CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let breaker = breaker(1, Duration::ZERO);
        breaker.record_failure();
        check!(breaker.state() == CircuitState::Open);
        // Cool-down of zero: the next call is the probe.
        check!(breaker.allow_call());
        check!(breaker.state() == CircuitState::HalfOpen);
        breaker.record_success();
        check!(breaker.state() == CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let breaker = breaker(1, Duration::ZERO);
        breaker.record_failure();
        check!(breaker.allow_call());
        breaker.record_failure();
        check!(breaker.state() == CircuitState::Open);
    }

    #[test]
    fn emits_events_on_transitions() {
        let breaker = breaker(1, Duration::ZERO);
        let mut events = breaker.subscribe();
        breaker.record_failure();
        check!(events.try_recv().unwrap() == CircuitEvent::Opened);
        check!(breaker.allow_call());
        check!(events.try_recv().unwrap() == CircuitEvent::HalfOpened);
        breaker.record_success();
        check!(events.try_recv().unwrap() == CircuitEvent::Closed);
    }
}
