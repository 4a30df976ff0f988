//! Per-(component, operation) circuit breakers.
//!
//! Classic three-state machine: `closed` counts consecutive failures and
//! opens at the threshold; `open` short-circuits until the reset timeout
//! has elapsed, then admits a single `half_open` probe; the probe's outcome
//! decides between `closed` and re-`open`.
//!
//! One logical breaker exists per `(component, operation)` key; the table is
//! a concurrent map so request threads never serialize on unrelated keys.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Breaker state as exposed to observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
        }
    }
}

/// Outcome of asking the table whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call may proceed (breaker closed, or a half-open probe was granted).
    Allowed,
    /// Breaker is open; the call must short-circuit.
    Rejected,
}

/// Concurrent breaker table keyed by `(component, operation)`.
pub struct BreakerTable {
    breakers: DashMap<(String, String), Breaker>,
    threshold: u32,
    reset_timeout: Duration,
}

impl BreakerTable {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold,
            reset_timeout,
        }
    }

    /// Gate a call. An open breaker whose reset timeout has elapsed
    /// transitions to half-open and admits this one call as the probe.
    pub fn admit(&self, component: &str, operation: &str) -> Admission {
        let key = (component.to_string(), operation.to_string());
        let mut breaker = self.breakers.entry(key).or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Rejected, // probe already in flight
            BreakerState::Open => {
                let elapsed = breaker
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed > self.reset_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful call: half-open probes close the breaker, and the
    /// failure streak resets either way.
    pub fn record_success(&self, component: &str, operation: &str) {
        let key = (component.to_string(), operation.to_string());
        if let Some(mut breaker) = self.breakers.get_mut(&key) {
            breaker.state = BreakerState::Closed;
            breaker.consecutive_failures = 0;
        }
    }

    /// Record a failed call. Cancellation counts as a failure here.
    pub fn record_failure(&self, component: &str, operation: &str) {
        let key = (component.to_string(), operation.to_string());
        let mut breaker = self.breakers.entry(key).or_insert_with(Breaker::new);
        breaker.last_failure_time = Some(Instant::now());

        match breaker.state {
            BreakerState::HalfOpen => {
                // Failed probe — back to open.
                breaker.state = BreakerState::Open;
            }
            BreakerState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.threshold {
                    breaker.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state for observability; `Closed` for unknown keys.
    pub fn state(&self, component: &str, operation: &str) -> BreakerState {
        self.breakers
            .get(&(component.to_string(), operation.to_string()))
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot of all non-closed breakers, for the alerts surface.
    pub fn tripped(&self) -> Vec<(String, String, BreakerState)> {
        self.breakers
            .iter()
            .filter(|e| e.value().state != BreakerState::Closed)
            .map(|e| {
                let (c, o) = e.key();
                (c.clone(), o.clone(), e.value().state)
            })
            .collect()
    }
}
