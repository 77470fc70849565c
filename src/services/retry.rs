//! Retry with exponential backoff for remote calls.
//!
//! A [`RetryPolicy`] decides how many attempts a call gets, which failures
//! are worth another attempt, and how long to pause between attempts. The
//! delay doubles after every retried failure and carries no jitter.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::services::llm::LlmError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: LlmError },
    /// A failure the classifier refused to retry.
    #[error("attempt {attempt} failed: {error}")]
    Aborted { attempt: u32, error: LlmError },
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub retryable: fn(&LlmError) -> bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Retries rate-limit failures only.
    pub fn rate_limited(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            retryable: LlmError::is_rate_limited,
        }
    }

    /// Pause taken after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !(self.retryable)(&error) => {
                    return Err(RetryError::Aborted { attempt, error });
                }
                Err(error) if attempt >= self.max_attempts => {
                    log::error!("All {} attempts failed: {}", attempt, error);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "{}. Retrying in {}ms... (Attempt {}/{})",
                        error,
                        delay.as_millis(),
                        attempt,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
