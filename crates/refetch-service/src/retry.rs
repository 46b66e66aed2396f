//! Bounded retry for transient-contention failures.
//!
//! [`run_with_retry`] decorates any fallible async operation whose failure
//! mode is "someone else got there first": it retries only errors that
//! classify as contention, backing off quadratically in the attempt number
//! until the configured deadline would be exceeded.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;

use refetch_store::StoreError;

/// Upper bound for the random jitter added to each backoff delay.
const JITTER_MAX_MS: u64 = 50;

/// Structural classification of contention errors.
///
/// Retry decisions are made by inspecting the error value itself, never by
/// matching on message text.
pub trait Contention {
    /// Whether this error means another party currently holds the contended
    /// resource, and retrying may succeed.
    fn is_contention(&self) -> bool;
}

impl Contention for StoreError {
    fn is_contention(&self) -> bool {
        self.is_duplicate_key()
    }
}

/// Options for [`run_with_retry`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Deadline by which the last attempt must start.
    #[serde(with = "humantime_serde")]
    pub no_later_than: Duration,
    /// Base delay; attempt `n` waits `start_attempts_delay * n²` plus
    /// jitter.
    #[serde(with = "humantime_serde")]
    pub start_attempts_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            no_later_than: Duration::from_millis(1000),
            start_attempts_delay: Duration::from_millis(50),
        }
    }
}

impl RetryOptions {
    /// The delay before the given 1-based attempt number.
    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS));
        self.start_attempts_delay * attempt * attempt + jitter
    }
}

/// Runs `task`, retrying contention failures within the deadline.
///
/// Non-contention errors are returned immediately. When the next attempt
/// could not start before `no_later_than` has elapsed, the original
/// contention error is returned instead.
pub async fn run_with_retry<T, E, F, Fut>(mut task: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Contention,
{
    let deadline = Instant::now() + options.no_later_than;
    let mut attempt: u32 = 0;

    loop {
        match task().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_contention() => {
                attempt += 1;
                let delay = options.backoff(attempt);
                if Instant::now() + delay > deadline {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
