//! Backoff for writes and for failing reconciles
//!
//! Conflicts on a single object are retried in place by [`retry_if`] with a
//! short, jittered delay. A reconcile that keeps failing is requeued by the
//! controller after [`backoff_delay`], which grows per node.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Base delay for requeueing a failing reconcile
pub const RETRY_BASE_DELAY_SECS: u64 = 5;

/// Upper bound on the requeue delay for a failing reconcile
pub const RETRY_MAX_DELAY_SECS: u64 = 300;

/// How often and how patiently to retry an operation in place
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubles afterwards
    pub initial_delay: Duration,
    /// Ceiling for the sleep between attempts
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Three quick attempts, for resourceVersion conflicts
    pub const fn conflict() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
        }
    }

    /// Un-jittered sleep after the given failed attempt (1-based)
    fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Requeue delay after `failures` consecutive failed reconciles
///
/// `base * 2^failures`, capped at `max`.
pub fn backoff_delay(failures: u32, base_secs: u64, max_secs: u64) -> Duration {
    let secs = base_secs
        .saturating_mul(2u64.saturating_pow(failures))
        .min(max_secs);
    Duration::from_secs(secs)
}

/// Run `operation`, retrying errors for which `should_retry` holds
///
/// Other errors return at once. After `max_attempts` the last error is
/// returned as is, so callers still see a conflict as a conflict.
pub async fn retry_if<F, Fut, T, P>(
    policy: &RetryPolicy,
    what: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !should_retry(&err) {
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            warn!(what, attempts = attempt, error = %err, "Giving up after retries");
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = policy.nominal_delay(attempt).mul_f64(jitter);
        debug!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "Retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
