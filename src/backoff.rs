/// Exponential backoff between attempts to bring a lost execution
/// environment back.
///
/// The delay doubles after every failed recovery, capped at the configured
/// maximum. `reset()` goes back to the initial delay once an environment has
/// stayed up long enough to be called stable.
use std::time::Duration;

use crate::config::RecoveryConfig;

const MULTIPLIER: u32 = 2;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    /// Consecutive recovery attempts since the last reset
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_delay_secs),
            Duration::from_secs(config.max_delay_secs),
        )
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = self
            .current_delay
            .saturating_mul(MULTIPLIER)
            .min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
