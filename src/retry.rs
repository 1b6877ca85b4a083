//! Bounded retries with exponential backoff and per-attempt timeouts.

use crate::config::RetryConfig;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget for a class of external calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound on a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Why a single attempt failed
#[derive(Debug)]
pub enum AttemptError<E> {
    Timeout(Duration),
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Timeout(d) => write!(f, "timed out after {} ms", d.as_millis()),
            AttemptError::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Outcome of a call whose retry budget ran out (or that hit a permanent error)
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: AttemptError<E>,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.last, self.attempts)
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Single attempt, no backoff
    pub fn once(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            call_timeout,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        let delay = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Run `op` until it succeeds or the budget is spent
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_while(operation, op, |_| true).await
    }

    /// Like [`run`](Self::run), but stops early when `retryable` rejects an error
    pub async fn run_while<T, E, F, Fut, R>(
        &self,
        operation: &'static str,
        mut op: F,
        retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = match tokio::time::timeout(self.call_timeout, op(attempt)).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    if !retryable(&e) {
                        return Err(RetryError {
                            attempts: attempt,
                            last: AttemptError::Failed(e),
                        });
                    }
                    AttemptError::Failed(e)
                }
                Err(_) => AttemptError::Timeout(self.call_timeout),
            };

            if attempt >= self.max_attempts {
                return Err(RetryError {
                    attempts: attempt,
                    last,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
