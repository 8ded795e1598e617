//! Bounded retries with exponential backoff and jitter.
//!
//! Every outbound call the engine makes (identity provider, agent runtime,
//! judge model) goes through a [`RetryPolicy`]. A policy bounds both the
//! number of attempts and the total wall-clock time spent on one logical
//! call, and only retries errors the caller classifies as transient.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between two attempts (in milliseconds)
    pub max_delay_ms: u64,
    /// Jitter factor for randomizing retry delays (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Wall-clock budget for all attempts of one call (in milliseconds)
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
            max_elapsed_ms: 120_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed_ms = max_elapsed.as_millis() as u64;
        self
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("Retry attempts must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("Jitter factor must be between 0.0 and 1.0".to_string());
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err("Max retry delay must not be below the base delay".to_string());
        }

        Ok(())
    }

    /// Calculate delay for retry attempt with exponential backoff and jitter
    pub fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let base_delay = Duration::from_millis(self.base_delay_ms);
        let exponential_delay = base_delay.saturating_mul(2_u32.saturating_pow(attempt));
        let max_delay = Duration::from_millis(self.max_delay_ms);

        let delay = exponential_delay.min(max_delay);

        if self.jitter_factor > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..=self.jitter_factor);
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay + Duration::from_millis(jitter_ms)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, runs out
    /// of attempts, or the next backoff would exceed the wall-clock budget.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut op: F,
        is_transient: P,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let start = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_transient(&e) {
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        warn!("{} failed after {} attempts: {}", operation, attempt, e);
                        return Err(e);
                    }

                    let delay = self.calculate_retry_delay(attempt - 1);
                    if start.elapsed() + delay > self.max_elapsed() {
                        warn!(
                            "{} exhausted its {:?} retry budget after {} attempts: {}",
                            operation,
                            self.max_elapsed(),
                            attempt,
                            e
                        );
                        return Err(e);
                    }

                    debug!(
                        "{} failed (attempt {}), retrying in {:?}: {}",
                        operation, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
