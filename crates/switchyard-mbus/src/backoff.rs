//! Reconnect delay for the NATS client.

use std::time::Duration;

/// Doubles the delay on every failed attempt, up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect attempt number `attempts` (0 = first retry).
    pub fn delay(&self, attempts: usize) -> Duration {
        // 2^16 * base is already far beyond any sane cap.
        let exp = attempts.min(16) as u32;
        self.base.saturating_mul(1 << exp).min(self.max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8))
    }
}
