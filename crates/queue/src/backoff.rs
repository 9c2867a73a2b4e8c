//! Exponential backoff policy.

use std::time::Duration;

use baton_core::{UnixMillis, duration_ms};

/// `delay(n) = base * 2^(n - 1)` for the `n`-th consecutive failure.
///
/// Growth is unbounded unless a cap is configured. All arithmetic saturates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Option<Duration>,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self { base, cap: None }
    }

    pub fn with_cap(mut self, cap: Option<Duration>) -> Self {
        self.cap = cap;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay after `error_count` consecutive failures (0 means none).
    pub fn delay_for(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return Duration::ZERO;
        }

        let factor = 1u128.checked_shl(error_count - 1).unwrap_or(u128::MAX);
        let ms = self.base.as_millis().saturating_mul(factor);
        let delay = Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX));

        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Absolute deadline before which no instance should process again.
    pub fn deadline_after(&self, error_count: u32, now: UnixMillis) -> UnixMillis {
        now.saturating_add(duration_ms(self.delay_for(error_count)))
    }
}
