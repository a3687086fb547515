//! Reconnect scheduling, kept apart from the transport so it can be tested alone.

use std::time::Duration;

/// Delay before reconnect attempts, with an optional attempt cap.
///
/// `multiplier` of 1.0 gives a fixed delay; anything larger grows the delay
/// geometrically up to `max_delay`. `max_attempts` of `None` retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            multiplier: 1.0,
            max_delay: delay,
            max_attempts: None,
        }
    }

    pub fn backoff(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            delay: base,
            multiplier: multiplier.max(1.0),
            max_delay: max_delay.max(base),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// once the attempt cap is exceeded.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        if self.multiplier <= 1.0 {
            return Some(self.delay);
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(capped))
    }
}
