//! Retry engine: bounded exponential backoff with jitter and Retry-After
//! honoring, over any error type that can classify itself.

use crate::{Backoff, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a server-driven Retry-After wait; never wait indefinitely.
pub const RETRY_AFTER_CAP: Duration = Duration::from_secs(300);

/// Errors the retry engine can classify without knowing their concrete type.
pub trait RetryableError: std::error::Error {
    fn is_retryable(&self) -> bool;

    /// Server-requested minimum wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for crate::ForgeError {
    fn is_retryable(&self) -> bool {
        crate::ForgeError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        crate::ForgeError::retry_after(self)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `operation`, retrying per the error's own classification.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, E>
    where
        E: RetryableError,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        self.execute_with(operation, |e: &E| e.is_retryable(), |_, _, _| {}).await
    }

    /// Run `operation` with an explicit retry predicate and an `on_retry`
    /// hook observing `(attempt, delay, error)` before each sleep.
    pub async fn execute_with<T, E, Fut, Op, P, H>(
        &self,
        mut operation: Op,
        should_retry: P,
        mut on_retry: H,
    ) -> Result<T, E>
    where
        E: RetryableError,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
        P: Fn(&E) -> bool,
        H: FnMut(u32, Duration, &E),
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !should_retry(&err) || attempt >= self.max_retries {
                        return Err(err);
                    }

                    let mut delay = self.backoff.jittered_delay(attempt);
                    // A server-driven wait is a floor on the next delay,
                    // capped so a hostile header can't park us forever.
                    if let Some(wait) = err.retry_after() {
                        delay = delay.max(wait.min(RETRY_AFTER_CAP));
                    }

                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    on_retry(attempt, delay, &err);
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }
}

pub struct RetryPolicyBuilder {
    max_retries: u32,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.backoff,
            sleeper: self.sleeper,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
