/*
[INPUT]:  Attempt numbers owned by the state machine
[OUTPUT]: Backoff delays and budget checks
[POS]:    Core - pure exponential backoff policy
[UPDATE]: When backoff shape or budget semantics change
*/

use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_interval: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_interval,
            max_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-indexed): `base * 2^(attempt-1)`, capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1).saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// Whether another attempt may start when `attempt` have been used.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_INTERVAL, DEFAULT_MAX_INTERVAL, DEFAULT_MAX_ATTEMPTS)
    }
}
