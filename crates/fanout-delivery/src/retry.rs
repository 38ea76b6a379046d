//! Retry policy: exponential backoff with jitter and a finite bound.
//!
//! Decides, for each failed attempt, whether to re-enqueue with a delay
//! or to give up. The bound is explicit: unbounded retry storms are not
//! allowed, and permanent failures never consult the backoff schedule.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy configuration.
///
/// Delays follow `base_delay * 2^(attempt - 1)`, capped at `max_delay`,
/// with `jitter_factor` randomization to spread retries out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for the exponential backoff curve.
    pub base_delay: Duration,

    /// Upper bound on any single retry delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to the computed delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2, // ±20% randomization
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// Delay before the envelope becomes visible again.
        after: Duration,
        /// Absolute time of the next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Finalize the envelope as permanently failed.
    GiveUp {
        /// Why no further attempts will be made.
        reason: String,
    },
}

/// Context for deciding what to do with one failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt number that just failed (1-based).
    pub attempt_count: u32,
    /// The failure being classified.
    pub error: DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: RetryPolicy,
}

impl RetryContext {
    /// Creates a retry context for a failed delivery attempt.
    pub fn new(
        attempt_count: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_count, error, failed_at, policy }
    }

    /// Decides whether to retry and when.
    ///
    /// Permanent failures give up immediately regardless of the attempt
    /// count; transient failures retry until `max_attempts` is reached.
    pub fn decide(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable failure: {}", self.error),
            };
        }

        if self.attempt_count >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.policy.max_attempts),
            };
        }

        let after = self.delay();
        let next_attempt_at = match chrono::Duration::from_std(after) {
            Ok(delay) => self.failed_at + delay,
            Err(_) => {
                return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
            },
        };

        RetryDecision::Retry { after, next_attempt_at }
    }

    /// Computes the delay before the next attempt.
    ///
    /// A Retry-After hint from a rate-limit response overrides the
    /// exponential schedule.
    fn delay(&self) -> Duration {
        if let Some(seconds) = self.error.retry_after_seconds() {
            return Duration::from_secs(seconds);
        }

        let exponent = self.attempt_count.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let backoff = self.policy.base_delay.saturating_mul(multiplier);
        let capped = std::cmp::min(backoff, self.policy.max_delay);

        std::cmp::min(apply_jitter(capped, self.policy.jitter_factor), self.policy.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor` to avoid thundering herds.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let clamped = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..Default::default() }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = no_jitter_policy();
        let delays: Vec<Duration> = (1..=4)
            .map(|attempt| {
                let context = RetryContext::new(
                    attempt,
                    DeliveryError::server(500, "oops"),
                    Utc::now(),
                    policy.clone(),
                );
                context.delay()
            })
            .collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 30,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let context =
            RetryContext::new(15, DeliveryError::timeout(30), Utc::now(), policy);
        assert_eq!(context.delay(), Duration::from_secs(60));
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        let context =
            RetryContext::new(3, DeliveryError::server(502, "bad gateway"), Utc::now(), policy);

        match context.decide() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => panic!("must give up at max attempts"),
        }
    }

    #[test]
    fn permanent_failure_gives_up_on_first_attempt() {
        let context = RetryContext::new(
            1,
            DeliveryError::client(400, "bad request"),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => panic!("client errors are never retried"),
        }
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let context = RetryContext::new(
            1,
            DeliveryError::rate_limited(Some(120)),
            Utc::now(),
            RetryPolicy::default(),
        );
        assert_eq!(context.delay(), Duration::from_secs(120));
    }

    #[test]
    fn retry_carries_absolute_next_attempt_time() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            DeliveryError::server(500, "oops"),
            failed_at,
            no_jitter_policy(),
        );

        match context.decide() {
            RetryDecision::Retry { after, next_attempt_at } => {
                assert_eq!(after, Duration::from_secs(1));
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(1));
            },
            RetryDecision::GiveUp { .. } => panic!("first transient failure must retry"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..50 {
            let jittered = apply_jitter(base, 0.2);
            assert!(jittered >= Duration::from_secs(8), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(12), "too large: {jittered:?}");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let base = Duration::from_secs(10);
        assert_eq!(apply_jitter(base, 0.0), base);
    }
}
