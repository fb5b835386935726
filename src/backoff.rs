//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic and are used by the
//! channel client for bounded reconnect delays and reply deadlines.

use std::future::Future;
use std::time::Duration;

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts after an unplanned close.
    pub max_attempts: u32,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 0-based; each step doubles the delay up to `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 0..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        std::cmp::min(delay, self.max_backoff)
    }

    /// Returns true when no further reconnect attempt should be scheduled.
    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
