//! Reconnect backoff and timeout utilities.
//!
//! The delay grows quadratically with the number of consecutive failures and
//! carries a jitter term that widens with the attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Consecutive failed sessions after which the subscriber gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Policy controlling the reconnect ceiling and backoff scale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Number of consecutive failed sessions that terminates the subscriber.
    pub max_attempts: u32,
    /// Time unit the backoff formula is expressed in.
    pub unit: Duration,
}

impl ReconnectPolicy {
    /// Computes the delay to wait after the given failed attempt.
    ///
    /// `attempt` is 1-based and corresponds to the number of consecutive
    /// failures observed so far.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let units = backoff_units(attempt, &mut rand::thread_rng());
        self.unit
            .saturating_mul(u32::try_from(units).unwrap_or(u32::MAX))
    }

    /// Returns true once `attempt` consecutive failures exhaust the policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            unit: Duration::from_secs(1),
        }
    }
}

/// Returns the backoff delay in seconds for the given 1-based attempt.
///
/// The delay is `attempt² + rand[0, attempt·4) · (attempt + 1)` seconds.
pub fn next_retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(backoff_units(attempt, &mut rand::thread_rng()))
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

fn backoff_units<R: Rng>(attempt: u32, rng: &mut R) -> u64 {
    debug_assert!(attempt > 0, "backoff is only defined for attempt >= 1");
    let step = u64::from(attempt.max(1));
    let jitter = rng.gen_range(0..step * 4);
    step * step + jitter * (step + 1)
}
