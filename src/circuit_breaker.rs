//! Per-service circuit breaker.
//!
//! Three-state machine gating an upstream service: closed → open after a run
//! of failures, open → half-open after a cooldown, half-open → closed after a
//! run of successes. Any failure in half-open reopens immediately, as does
//! exhausting the half-open attempt budget without closing.

use crate::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 3,
        }
    }
}

/// Point-in-time view of a breaker, exposed through the degradation monitor.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<u64>,
    pub half_open_attempts: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<u64>,
    half_open_attempts: u32,
}

/// Three-state failure detector for one upstream service.
///
/// State transitions happen inside [`CircuitBreaker::can_request`] and the
/// two record methods; `health()` never transitions.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                half_open_attempts: 0,
            }),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether a request may be issued right now.
    ///
    /// In the open state this is where the cooldown expiry is observed and
    /// the breaker moves to half-open; in half-open each permitted call
    /// consumes one attempt from the budget.
    pub fn can_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let now = self.clock.now_millis();
                let opened = inner.last_failure_at.unwrap_or(0);
                if now.saturating_sub(opened) >= self.config.reset_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_attempts = 1;
                    inner.consecutive_successes = 0;
                    tracing::info!(service = %self.service, "circuit breaker → half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max_attempts {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    // Attempt budget spent without closing: back to open.
                    inner.state = CircuitState::Open;
                    inner.last_failure_at = Some(self.clock.now_millis());
                    tracing::warn!(
                        service = %self.service,
                        attempts = inner.half_open_attempts,
                        "circuit breaker: half-open attempts exhausted → open"
                    );
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;
        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            inner.state = CircuitState::Closed;
            inner.half_open_attempts = 0;
            inner.last_failure_at = None;
            tracing::info!(service = %self.service, "circuit breaker → closed");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(self.clock.now_millis());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Reopen on any half-open failure.
                inner.state = CircuitState::Open;
                tracing::warn!(service = %self.service, "circuit breaker: probe failed → open");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn health(&self) -> BreakerHealth {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        BreakerHealth {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
            half_open_attempts: inner.half_open_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: ManualClock) -> CircuitBreaker {
        CircuitBreaker::new("forge", BreakerConfig::default()).with_clock(clock)
    }

    #[test]
    fn starts_closed_and_allows_requests() {
        let cb = breaker(ManualClock::new());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = breaker(ManualClock::new());
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[test]
    fn success_resets_failure_run() {
        let cb = breaker(ManualClock::new());
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn transitions_to_half_open_after_reset_timeout() {
        let clock = ManualClock::new();
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(!cb.can_request());

        clock.advance(30_000);
        assert!(cb.can_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let clock = ManualClock::new();
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(30_000);
        assert!(cb.can_request());

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let clock = ManualClock::new();
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(30_000);
        assert!(cb.can_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[test]
    fn half_open_attempt_budget_reopens_when_spent() {
        let clock = ManualClock::new();
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(30_000);

        // Three probes permitted, none recorded a success.
        assert!(cb.can_request());
        assert!(cb.can_request());
        assert!(cb.can_request());
        assert!(!cb.can_request());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn reopened_breaker_waits_full_cooldown_again() {
        let clock = ManualClock::new();
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(30_000);
        assert!(cb.can_request());
        cb.record_failure();

        clock.advance(29_999);
        assert!(!cb.can_request());
        clock.advance(1);
        assert!(cb.can_request());
    }

    #[test]
    fn health_reports_without_transitioning() {
        let clock = ManualClock::new();
        let cb = breaker(clock.clone());
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(60_000);

        // health() must not consume the cooldown observation.
        let health = cb.health();
        assert_eq!(health.state, CircuitState::Open);
        assert_eq!(health.consecutive_failures, 5);
        assert!(health.last_failure_at.is_some());

        assert!(cb.can_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
