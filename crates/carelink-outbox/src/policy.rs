//! Retry policy and backoff schedule.

use carelink_core::OutboxSettings;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Retry behaviour for outbox items.
///
/// Retry delay follows exponential backoff: `base * 2^(attempt - 1)`
/// capped at `backoff_max`. With the defaults:
/// - 1st retry: 2s
/// - 2nd retry: 4s
/// - 3rd retry: 8s
/// - 4th retry: 16s
///
/// and the fifth failure abandons the item.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts after which an item is abandoned.
    pub max_attempts: u32,
    /// Base duration for exponential backoff.
    pub backoff_base: Duration,
    /// Maximum backoff (caps exponential growth).
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl From<&OutboxSettings> for RetryPolicy {
    fn from(settings: &OutboxSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// When the next attempt may run after failure number `attempt`.
    ///
    /// Always strictly later than `previous`, even with a zero backoff or a
    /// clock that stepped backwards.
    pub fn next_attempt_at(
        &self,
        attempt: u32,
        now: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let scheduled = now + compute_backoff(attempt, self);
        let floor = previous + chrono::Duration::milliseconds(1);
        scheduled.max(floor)
    }
}

/// Computes the exponential backoff duration for a given attempt count.
///
/// | Attempt | Delay (base=2s, max=300s) |
/// |---------|---------------------------|
/// | 0       | 0s                        |
/// | 1       | 2s                        |
/// | 2       | 4s                        |
/// | 3       | 8s                        |
/// | 8       | 256s                      |
/// | 9+      | 300s                      |
pub fn compute_backoff(attempt: u32, policy: &RetryPolicy) -> chrono::Duration {
    if attempt == 0 {
        return chrono::Duration::zero();
    }

    let base_ms = policy.backoff_base.as_millis() as u64;
    let max_ms = policy.backoff_max.as_millis() as u64;
    let shift = attempt.saturating_sub(1);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64)
}
