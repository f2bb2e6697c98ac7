//! Uniform timeout and retry policy for every collaborator call.
//!
//! Feed fetches, search queries, AI requests and database writes all go
//! through a [`CallPolicy`]. Each attempt runs under its own deadline; a
//! deadline that expires is reported in the caller's error type via
//! [`FromTimeout`], so a slow collaborator fails that one call and nothing
//! else. Transient failures are retried with exponential backoff and jitter.
//!
//! # Backoff Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=max_jitter)
//! ```

use crate::errors::{FromTimeout, Transient};
use rand::{Rng, rng};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{error, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct CallPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Extra attempts after the first one; zero disables retrying.
    pub max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl CallPolicy {
    pub fn new(timeout: Duration, max_retries: usize) -> Self {
        Self {
            timeout,
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=self.max_jitter.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Run `f` under the policy, retrying transient failures.
    pub async fn call<T, E, F, Fut>(&self, op: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FromTimeout + Transient + fmt::Display,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            let err = match timeout(self.timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => E::timed_out(op, self.timeout),
            };
            attempt += 1;

            if attempt > self.max_retries || !err.is_transient() {
                error!(
                    op,
                    attempt,
                    max = self.max_retries,
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    error = %err,
                    "call failed"
                );
                return Err(err);
            }

            let delay = self.backoff(attempt);
            warn!(
                op,
                attempt,
                max = self.max_retries,
                elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
                ?delay,
                error = %err,
                "call attempt failed; backing off"
            );
            sleep(delay).await;
        }
    }

    /// Like [`call`](Self::call), but a final failure is replaced by `fallback`.
    pub async fn call_or_else<T, E, F, Fut, G>(&self, op: &str, f: F, fallback: G) -> Settled<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FromTimeout + Transient + fmt::Display,
        G: FnOnce(&E) -> T,
    {
        match self.call(op, f).await {
            Ok(value) => Settled::Primary(value),
            Err(e) => Settled::Fallback(fallback(&e), e),
        }
    }
}

impl fmt::Debug for CallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPolicy")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

/// Result of [`CallPolicy::call_or_else`]: always a value, sometimes an error too.
#[derive(Debug)]
pub enum Settled<T, E> {
    Primary(T),
    Fallback(T, E),
}

impl<T, E> Settled<T, E> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Settled::Fallback(..))
    }

    pub fn into_parts(self) -> (T, Option<E>) {
        match self {
            Settled::Primary(v) => (v, None),
            Settled::Fallback(v, e) => (v, Some(e)),
        }
    }
}
