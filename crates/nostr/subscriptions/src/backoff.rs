//! Exponential backoff for reconnection and a retry policy for sends.

use crate::clock::Clock;
use crate::error::ClientError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How much randomness is mixed into each reconnect delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Deterministic delays
    None,
    /// Uniform in `0..=delay`, so reconnecting clients spread out
    Full,
}

/// `base * 2^attempt`, capped at `max`.
fn capped_exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis();
    let multiplier = 1u128.checked_shl(attempt.min(63)).unwrap_or(u128::MAX);
    let capped_ms = base_ms.saturating_mul(multiplier).min(max.as_millis());
    Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
}

/// Delay sequence between reconnect attempts to one relay.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    limit: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// A `max_attempts` of zero never exhausts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            limit: (max_attempts != 0).then_some(max_attempts),
            jitter: Jitter::Full,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt, or `None` once the limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let capped = capped_exponential(self.base_delay, self.max_delay, self.attempt);
        let delay = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                let upper = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::rng().random_range(0..=upper))
            }
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Called after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.attempt >= limit)
    }
}

impl Default for ExponentialBackoff {
    /// One second doubling up to a minute, forever.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0)
    }
}

/// How often and how patiently a failed send is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay to wait before retry number `attempt` (0-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        capped_exponential(self.base_delay, self.max_delay, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

/// Result of [`retry_with_policy`]: the final outcome and how many attempts
/// were made in total.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ClientError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy is exhausted. Sleeps go through `clock`.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(e) if attempt < policy.max_attempts && e.is_transient() => {
                let delay = policy.compute_delay(attempt);
                debug!("Attempt {} failed ({}), retrying in {:?}", attempt + 1, e, delay);
                clock.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt + 1,
                };
            }
        }
    }
}
