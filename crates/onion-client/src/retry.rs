//! Bounded-attempt retry with a minimum delay between attempts

use std::future::Future;
use std::time::Duration;

/// How many times to try and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_timeout: Duration,
    /// Delay multiplier applied after every failed attempt
    pub factor: u32,
}

impl RetryPolicy {
    pub fn new(attempts: u32, min_timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            min_timeout,
            factor: 1,
        }
    }

    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.min_timeout
            .saturating_mul(self.factor.saturating_pow(exp))
    }
}

/// Outcome of a retried operation that never succeeded
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error not worth retrying
    Permanent(E),
    /// Every attempt failed; `last` is the final error
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: RetryPolicy,
    mut op: F,
    should_retry: R,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(RetryError::Permanent(e)),
            Err(e) if attempt >= policy.attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
