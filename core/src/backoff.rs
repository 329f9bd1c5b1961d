// Exponential backoff shared by the change-stream listener and the
// client-side reconnection manager.

use std::time::Duration;

/// `delay(attempt) = min(base * 2^attempt, cap)`.
///
/// Monotonically non-decreasing until the cap; callers reset their attempt
/// counter to zero on any successful connection. There is no maximum attempt
/// count; dashboards are long-lived and retry until explicit teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}
