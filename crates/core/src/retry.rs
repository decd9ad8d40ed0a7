use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::UpstreamError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

/// Exponent cap so `base * 2^attempt` cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

/// Errors the retrier is allowed to absorb.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        self.is_quota_exhausted()
    }
}

impl RetryPolicy {
    /// Deterministic part of the wait after the zero-based `attempt` failed.
    pub fn backoff_floor(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(multiplier)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_floor(attempt) + jitter(self.max_jitter)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Run `action` until it succeeds, fails with a non-retryable error, or
/// exhausts `policy.max_attempts`. Only quota-class errors are retried.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        let error = match action().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Upstream call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        if attempt + 1 >= max_attempts {
            warn!(
                max_attempts,
                error = %error,
                "Quota exhausted; giving up after final attempt"
            );
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Quota exhausted; backing off before retry"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
