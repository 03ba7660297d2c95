//! Reconnect delay policy.
//!
//! The reconnect loop never gives up; the policy only decides how long to
//! wait before each attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(crate::DEFAULT_RECONNECT_DELAY_MS);

/// Delay strategy for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Same delay before every attempt.
    Fixed { delay: Duration },
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        RetryPolicy::Exponential { base, max }
    }

    /// Delay before the given attempt (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { delay } => delay,
            RetryPolicy::Exponential { base, max } => {
                let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(DEFAULT_RECONNECT_DELAY)
    }
}
