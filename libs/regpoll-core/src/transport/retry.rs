//! Retry policy with exponential backoff
//!
//! Classification and backoff are kept apart from the protocol calls: the
//! driver takes any async operation plus a classifier.

use crate::error::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Whether a failed attempt is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Transport errors classify on connection resets, broken pipes, EOF and timeouts
pub fn classify(error: &TransportError) -> ErrorClass {
    if error.is_transient() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::requests()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            backoff_multiplier: 2.0,
        }
    }

    /// Per-request transport policy: 10 retries from 30 ms
    pub fn requests() -> Self {
        Self::new(10, Duration::from_millis(30))
    }

    /// Write read-back policy: 6 reads in total from 100 ms
    pub fn stabilization() -> Self {
        Self::new(5, Duration::from_millis(100))
    }

    /// Build from a total attempt count, never below one attempt
    pub fn with_attempts(attempts: u32, initial_backoff: Duration) -> Self {
        Self::new(attempts.saturating_sub(1), initial_backoff)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        self.initial_backoff
            .mul_f64(self.backoff_multiplier.powi(exponent))
    }

    /// Run `operation` until it succeeds, fails fatally or the budget runs out.
    ///
    /// `operation` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, mut operation: F, classify: C) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                },
                Err(error) => {
                    if classify(&error) == ErrorClass::Fatal {
                        return Err(RetryFailure::Fatal(error));
                    }
                    if attempt >= self.max_retries {
                        return Err(RetryFailure::Exhausted {
                            attempts: attempt + 1,
                            last: error,
                        });
                    }
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    info!(
                        "Retry {}/{} in {:?}: {}",
                        attempt, self.max_retries, delay, error
                    );
                    sleep(delay).await;
                },
            }
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryFailure<E> {
    Fatal(E),
    Exhausted { attempts: u32, last: E },
}
