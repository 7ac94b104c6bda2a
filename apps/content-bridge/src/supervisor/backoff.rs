use std::time::Duration;

/// Reconnect delay policy: `max(base, floor) * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    floor: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, floor: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            floor,
            max_attempts,
        }
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit = self.base.max(self.floor);
        let exponent = attempt.saturating_sub(1).min(20);
        unit.saturating_mul(1u32 << exponent)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
