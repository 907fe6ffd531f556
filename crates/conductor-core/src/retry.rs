//! Retry backoff policy.
//!
//! The executor retries by re-enqueueing the message with a delay; this
//! module only computes that delay. Attempt 1 is the initial enqueue and
//! carries no delay; attempt n >= 2 waits `min(base * 2^(n-2), cap)`.
//! With the defaults (base 2s, cap 16s) attempts 1..=5 wait
//! 0, 2, 4, 8 and 16 seconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap, expressed in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the second attempt, in seconds.
    pub base_secs: u64,
    /// Upper bound on any computed delay, in seconds.
    pub cap_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 2,
            cap_secs: 16,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_secs: u64, cap_secs: u64) -> Self {
        Self {
            base_secs,
            cap_secs,
        }
    }

    /// Delay to apply before dispatching `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt - 2;
        let secs = if exp >= 64 {
            self.cap_secs
        } else {
            // Widen before shifting so large attempts saturate at the cap
            // instead of wrapping.
            let raw = (self.base_secs as u128) << exp;
            raw.min(self.cap_secs as u128) as u64
        };
        Duration::from_secs(secs)
    }
}
