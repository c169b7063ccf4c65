//! Bounded reconnect backoff.

use std::time::Duration;

use crate::config::LinkConfig;

/// Linear backoff with a cap: `min(base * attempt, max_delay)` for attempts
/// `1..=max_attempts`, then nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionPolicy {
   pub max_attempts: u32,
   pub base_delay: Duration,
   pub max_delay: Duration,
}

impl Default for ReconnectionPolicy {
   fn default() -> Self {
      Self {
         max_attempts: 5,
         base_delay: Duration::from_secs(1),
         max_delay: Duration::from_secs(5),
      }
   }
}

impl ReconnectionPolicy {
   pub const fn from_config(config: &LinkConfig) -> Self {
      Self {
         max_attempts: config.reconnect_max_attempts,
         base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
         max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
      }
   }

   /// Delay before the given 1-based attempt, `None` once exhausted.
   pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
      if attempt == 0 || attempt > self.max_attempts {
         return None;
      }
      Some(self.base_delay.saturating_mul(attempt).min(self.max_delay))
   }
}
