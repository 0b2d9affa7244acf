//! Consecutive-failure circuit breaker.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::broker::BrokerError;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Calls fail fast until the cool-down elapses.
    Open,
    /// A single probe call is in flight.
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Opens after `threshold` consecutive failures and rejects every call for
/// `cool_down`. The first call after the cool-down is admitted as a probe:
/// success closes the circuit, failure reopens it for another cool-down.
/// Every other caller fails fast for as long as the probe is in flight.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cool_down: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cool_down: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cool_down,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Admit or reject a call.
    ///
    /// The returned [`Permit`] must be settled with [`Permit::success`] or
    /// [`Permit::failure`]. A probe permit dropped unsettled returns the
    /// circuit to open with the cool-down already elapsed, so the next caller
    /// becomes the probe.
    pub fn try_acquire(&self) -> Result<Permit<'_>, BrokerError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let current = *inner;

        match current {
            Inner::Closed { .. } => Ok(Permit::new(self, false)),
            Inner::Open { until } if now >= until => {
                info!("Circuit half-open, admitting probe");
                *inner = Inner::HalfOpen;
                Ok(Permit::new(self, true))
            }
            Inner::Open { until } => Err(BrokerError::BrokenCircuit {
                retry_after: until - now,
            }),
            Inner::HalfOpen => Err(BrokerError::BrokenCircuit {
                retry_after: self.cool_down,
            }),
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        let current = *inner;
        if !matches!(current, Inner::Closed { failures: 0 }) {
            if matches!(current, Inner::HalfOpen) {
                info!("Circuit closed");
            }
            *inner = Inner::Closed { failures: 0 };
        }
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        let current = *inner;

        let failures = match current {
            Inner::Closed { failures } => failures + 1,
            Inner::Open { .. } | Inner::HalfOpen => self.threshold,
        };

        if failures >= self.threshold {
            warn!(
                failures,
                cool_down_ms = self.cool_down.as_millis() as u64,
                "Circuit opened"
            );
            *inner = Inner::Open {
                until: now + self.cool_down,
            };
        } else {
            *inner = Inner::Closed { failures };
        }
    }

    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if matches!(*inner, Inner::HalfOpen) {
            warn!("Circuit probe abandoned before completing");
            *inner = Inner::Open {
                until: Instant::now(),
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug)]
#[must_use = "a permit must be settled with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.abandon_probe();
        }
    }
}
