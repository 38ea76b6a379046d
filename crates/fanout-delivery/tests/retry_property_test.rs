//! Property-based tests for the retry policy.
//!
//! The backoff schedule has invariants that must hold for every
//! combination of attempt count and policy settings, not just the
//! handful of values unit tests pick.

use std::time::Duration;

use chrono::Utc;
use fanout_delivery::{DeliveryError, RetryContext, RetryDecision, RetryPolicy};
use proptest::prelude::*;

fn retryable_error() -> impl Strategy<Value = DeliveryError> {
    prop_oneof![
        Just(DeliveryError::network("connection reset")),
        Just(DeliveryError::timeout(30)),
        (500_u16..=599).prop_map(|status| DeliveryError::server(status, "server error")),
        Just(DeliveryError::rate_limited(None)),
        Just(DeliveryError::broker("publish failed")),
    ]
}

fn permanent_error() -> impl Strategy<Value = DeliveryError> {
    prop_oneof![
        (400_u16..=428).prop_map(|status| DeliveryError::client(status, "client error")),
        (430_u16..=499).prop_map(|status| DeliveryError::client(status, "client error")),
        Just(DeliveryError::serialization("bad payload")),
        Just(DeliveryError::configuration("bad url")),
    ]
}

fn policy() -> impl Strategy<Value = RetryPolicy> {
    (1_u32..=20, 1_u64..=10_000, 1_u64..=600_000, 0.0_f64..=1.0).prop_map(
        |(max_attempts, base_ms, max_ms, jitter_factor)| RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_factor,
        },
    )
}

proptest! {
    /// A delay never exceeds the configured ceiling, whatever the
    /// attempt count or jitter roll.
    #[test]
    fn delay_never_exceeds_cap(
        attempt in 1_u32..=100,
        error in retryable_error(),
        policy in policy(),
    ) {
        let max_delay = policy.max_delay;
        let context = RetryContext::new(attempt, error, Utc::now(), policy);

        if let RetryDecision::Retry { after, .. } = context.decide() {
            // Retry-After hints bypass the schedule and its cap.
            if context.error.retry_after_seconds().is_none() {
                prop_assert!(after <= max_delay, "delay {after:?} over cap {max_delay:?}");
            }
        }
    }

    /// Without jitter the schedule is nondecreasing in the attempt
    /// count.
    #[test]
    fn backoff_is_nondecreasing_without_jitter(
        attempt in 1_u32..=50,
        base_ms in 1_u64..=10_000,
    ) {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        };
        let error = DeliveryError::server(500, "oops");

        let delay_at = |attempt| {
            let context = RetryContext::new(attempt, error.clone(), Utc::now(), policy.clone());
            match context.decide() {
                RetryDecision::Retry { after, .. } => after,
                RetryDecision::GiveUp { .. } => panic!("within max_attempts"),
            }
        };

        prop_assert!(delay_at(attempt) <= delay_at(attempt + 1));
    }

    /// Reaching the attempt bound always gives up, for every
    /// retryable error.
    #[test]
    fn gives_up_at_or_past_the_bound(
        error in retryable_error(),
        policy in policy(),
        over in 0_u32..=10,
    ) {
        let attempt = policy.max_attempts + over;
        let context = RetryContext::new(attempt, error, Utc::now(), policy);
        prop_assert!(
            matches!(context.decide(), RetryDecision::GiveUp { .. }),
            "expected GiveUp at or past the attempt bound",
        );
    }

    /// Permanent errors never retry, even on the first attempt with a
    /// generous policy.
    #[test]
    fn permanent_errors_never_retry(
        error in permanent_error(),
        policy in policy(),
    ) {
        prop_assert!(!error.is_retryable());
        let context = RetryContext::new(1, error, Utc::now(), policy);
        prop_assert!(
            matches!(context.decide(), RetryDecision::GiveUp { .. }),
            "expected GiveUp for a permanent error",
        );
    }

    /// Below the bound, every retryable error gets a retry with a
    /// consistent absolute timestamp.
    #[test]
    fn retryable_errors_retry_below_the_bound(
        error in retryable_error(),
        base_ms in 1_u64..=10_000,
    ) {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.2,
        };
        let failed_at = Utc::now();
        let context = RetryContext::new(1, error, failed_at, policy);

        match context.decide() {
            RetryDecision::Retry { after, next_attempt_at } => {
                let expected = failed_at + chrono::Duration::from_std(after).unwrap();
                prop_assert_eq!(next_attempt_at, expected);
            },
            RetryDecision::GiveUp { .. } => prop_assert!(false, "must retry below the bound"),
        }
    }
}
