//! Capped exponential backoff shared by registration, polling, and reporting.

use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
pub fn delay_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Doubling delay that resets after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay to wait now and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}
