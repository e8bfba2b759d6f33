//! Reconnect backoff policy

use std::time::Duration;

/// Exponential backoff for subscription reconnects.
///
/// Delays double from `base` up to `max`; a successfully processed batch
/// resets the sequence so a long-lived stream that hiccups once does not
/// pay for failures from hours ago.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay to sleep before the next reconnect attempt.
    pub fn next_backoff(&mut self) -> Duration {
        let exp = self.attempt.min(31);
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after forward progress.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
