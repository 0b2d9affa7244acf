//! Resilience policies wrapped around broker connect attempts.
//!
//! A [`ResiliencePolicy`] is a [`CircuitBreaker`] around a [`RetryPolicy`]:
//! the retry policy absorbs short outages with exponential backoff, and once
//! enough retry sequences in a row are exhausted the breaker opens and every
//! caller fails fast until the cool-down elapses.

mod circuit_breaker;

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use tracing::warn;

use crate::broker::BrokerError;

pub use circuit_breaker::{CircuitBreaker, CircuitState, Permit};

/// Retry stage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt).
    pub retries: usize,
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Cap on the delay between retries.
    pub max_delay_ms: u64,
    /// Randomize delays to avoid reconnect storms from many clients.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            min_delay_ms: 100,
            max_delay_ms: 400,
            jitter: false,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive exhausted retry sequences before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub cool_down_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            cool_down_ms: 500,
        }
    }
}

/// Combined resilience configuration for a connection manager.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Exponential backoff retry around a fallible async operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retries: usize,
    backoff: ExponentialBuilder,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(config.min_delay_ms))
            .with_max_delay(Duration::from_millis(config.max_delay_ms.max(config.min_delay_ms)))
            .with_max_times(config.retries);
        if config.jitter {
            backoff = backoff.with_jitter();
        }

        Self {
            retries: config.retries,
            backoff,
        }
    }

    /// Total attempts a single [`run`](Self::run) makes before giving up.
    pub fn max_attempts(&self) -> usize {
        self.retries + 1
    }

    /// Run `operation` until it succeeds or the retry stages are exhausted.
    ///
    /// Returns the error of the last attempt on exhaustion.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let delays = self.backoff.build();
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(delays).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        operation = name,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts(),
                        error = %e,
                        "Broker operation failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::Unreachable(format!("{name}: no attempt was made"))))
    }
}

/// Circuit breaker wrapped around a retry policy.
#[derive(Debug)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResiliencePolicy {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::new(&config.retry),
            breaker: CircuitBreaker::new(
                config.circuit_breaker.failure_threshold,
                Duration::from_millis(config.circuit_breaker.cool_down_ms),
            ),
        }
    }

    /// Execute `operation` through the breaker and then the retry policy.
    ///
    /// While the circuit is open this returns [`BrokerError::BrokenCircuit`]
    /// without invoking `operation`. The same applies while another caller
    /// holds the half-open probe.
    pub async fn execute<T, F, Fut>(&self, name: &str, operation: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let permit = self.breaker.try_acquire()?;

        match self.retry.run(name, operation).await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::new(&ResilienceConfig::default())
    }
}
