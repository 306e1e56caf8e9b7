//! Fixed-delay retry primitive for the dataplane commit's retry-once rule
//! (§4.4: a failed `iptables-restore`/`ipset` commit is retried exactly
//! once after a short fixed delay, then surfaces as a hard failure).
//!
//! Trimmed down to a single fixed delay: no sliding window, no
//! restart-count rate limiting, because a dataplane commit either
//! succeeds on the single retry or the whole process exits — there is no
//! "too many restarts, escalate" case to guard against here.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
// (none)

/// A single fixed delay before one retry attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnce {
    delay: Duration,
}

impl RetryOnce {
    /// Create a retry policy with the given delay before the single retry.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// The delay to wait before retrying.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `attempt` once; on failure, sleep for [`delay`](Self::delay) and
    /// run it exactly one more time, returning whatever that second
    /// attempt produces.
    pub async fn run<F, Fut, T, E>(&self, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        match attempt().await {
            Ok(value) => Ok(value),
            Err(_first_error) => {
                tokio::time::sleep(self.delay).await;
                attempt().await
            }
        }
    }
}

impl Default for RetryOnce {
    /// 500ms, matching the teacher's `base_delay` order of magnitude for a
    /// single quick retry rather than a backoff series.
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
