//! Opt-in retries for a [`Transport`].
//!
//! The writer itself makes exactly one transport call per batch. Wrap a
//! transport in [`RetryingTransport`] to retry failed calls with exponential
//! backoff; all attempts count against the writer's `transport_timeout`.

use crate::error::TransportError;
use crate::transport::{Batch, Transport, TransportResponse};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double delay each retry).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-indexed; the first attempt never waits).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Whether a failed response is worth another attempt.
///
/// Client errors other than 429 mean the agent rejected the payload itself.
fn is_retryable(response: &TransportResponse) -> bool {
    if let Some(error) = &response.error {
        return error.is_retryable();
    }
    match response.status {
        Some(429) => true,
        Some(status) => !(400..500).contains(&status),
        None => true,
    }
}

/// A transport wrapper that retries failed sends with exponential backoff.
pub struct RetryingTransport<T: Transport> {
    inner: T,
    config: RetryConfig,
    /// Metrics: total retry attempts made
    total_retries: AtomicU64,
    /// Metrics: sends that succeeded after at least one retry
    recovered_sends: AtomicU64,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_sends: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: T) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn recovered_sends(&self) -> u64 {
        self.recovered_sends.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Transport> Transport for RetryingTransport<T> {
    async fn send(&self, batch: Batch) -> TransportResponse {
        let max_attempts = self.config.max_retries + 1;
        let mut last = TransportResponse::error(TransportError::RetriesExhausted { attempts: 0 });

        for attempt in 0..max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug_assert!(delay <= self.config.max_delay);
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                sleep(delay).await;
            }

            let response = self.inner.send(batch.clone()).await;
            if response.is_success() {
                if attempt > 0 {
                    self.recovered_sends.fetch_add(1, Ordering::Relaxed);
                }
                return response;
            }
            if !is_retryable(&response) {
                return response;
            }
            debug!(
                transport = self.inner.name(),
                attempt,
                status = ?response.status,
                "send failed, will retry"
            );
            last = response;
        }

        last.error = Some(TransportError::RetriesExhausted {
            attempts: max_attempts,
        });
        last
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
