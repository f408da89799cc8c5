//! Retry policy: what happens to an item after a delivery attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of one delivery attempt, as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The channel transport accepted the message.
    Delivered,
    /// Transient failure; retried while attempts remain.
    Failed(String),
    /// Permanent failure (e.g. the notification no longer exists); never retried.
    Rejected(String),
}

/// Next state of an item after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sent,
    Retry {
        scheduled_for: DateTime<Utc>,
        error: String,
    },
    Failed {
        error: String,
    },
}

/// Output of [`RetryPolicy::decide`]: the new attempt count plus the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub attempts: u32,
    pub transition: Transition,
}

/// Exponential backoff bounded by the item's `max_attempts`.
///
/// The delay before retry `n` (1-indexed) is `base_delay * multiplier^(n-1)`;
/// with the defaults that is 5, 15, 45 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5 * 60),
            multiplier: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: u32) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        self.multiplier
            .checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Decide the next state of an item that has made `attempts` attempts so
    /// far, given the outcome of the one that just finished.
    ///
    /// The returned attempt count never exceeds `max_attempts`, and reaching it
    /// on a failure always yields `Transition::Failed`.
    pub fn decide(
        &self,
        attempts: u32,
        max_attempts: u32,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Decision {
        let (error, retryable) = match outcome {
            DeliveryOutcome::Delivered => {
                return Decision {
                    attempts,
                    transition: Transition::Sent,
                };
            }
            DeliveryOutcome::Failed(error) => (error, true),
            DeliveryOutcome::Rejected(error) => (error, false),
        };

        let attempts = attempts.saturating_add(1).min(max_attempts.max(1));

        if !retryable || attempts >= max_attempts {
            return Decision {
                attempts,
                transition: Transition::Failed { error },
            };
        }

        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(chrono::Duration::MAX);
        let scheduled_for = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Decision {
            attempts,
            transition: Transition::Retry {
                scheduled_for,
                error,
            },
        }
    }
}
