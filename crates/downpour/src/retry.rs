//! Backoff schedule and the per-attempt retry decision.

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;

/// Exponential backoff with optional jitter, capped at `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random skew so parallel retries do
    /// not land on the remote at the same instant.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            jitter: true,
        }
    }
}

/// What the attempt loop should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then run the next attempt.
    RetryAfter(Duration),
    /// Give up and report the failure.
    Fail,
}

impl BackoffPolicy {
    /// Delay before retrying after attempt number `attempt` (0-indexed)
    /// failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64 << attempt.min(62);
        let mut delay_ms = base_ms.saturating_mul(factor).min(max_ms);
        if self.jitter && base_ms > 0 {
            let headroom = (max_ms - delay_ms).min(base_ms / 2);
            if headroom > 0 {
                delay_ms += rand::rng().random_range(0..headroom);
            }
        }
        Duration::from_millis(delay_ms)
    }

    /// Pure mapping from (error class, attempt number) to the next step.
    ///
    /// `attempt` is 0-indexed, `budget` is the number of retries allowed
    /// on top of the initial attempt. Only transient failures with
    /// budget left earn another attempt; permanent, fatal and cancelled
    /// outcomes fail straight away.
    pub fn decide(&self, class: ErrorClass, attempt: u32, budget: u32) -> RetryDecision {
        match class {
            ErrorClass::Transient if attempt < budget => {
                RetryDecision::RetryAfter(self.delay_for(attempt))
            }
            _ => RetryDecision::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter: false,
        }
    }

    #[test]
    fn delays_double_without_jitter() {
        let policy = policy(100, 10_000);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy(500, 5_000);
        assert_eq!(policy.delay_for(20), Duration::from_millis(5_000));
        // absurd attempt numbers must not overflow
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_under_the_cap() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for attempt in 0..16 {
            assert!(policy.delay_for(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn transient_retries_until_the_budget_runs_out() {
        let policy = policy(10, 100);
        assert_eq!(
            policy.decide(ErrorClass::Transient, 0, 2),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            policy.decide(ErrorClass::Transient, 1, 2),
            RetryDecision::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(policy.decide(ErrorClass::Transient, 2, 2), RetryDecision::Fail);
    }

    #[test]
    fn zero_budget_means_a_single_attempt() {
        let policy = policy(10, 100);
        assert_eq!(policy.decide(ErrorClass::Transient, 0, 0), RetryDecision::Fail);
    }

    #[test]
    fn only_transient_failures_retry() {
        let policy = policy(10, 100);
        assert_eq!(policy.decide(ErrorClass::Permanent, 0, 5), RetryDecision::Fail);
        assert_eq!(policy.decide(ErrorClass::Fatal, 0, 5), RetryDecision::Fail);
        assert_eq!(policy.decide(ErrorClass::Cancelled, 0, 5), RetryDecision::Fail);
    }
}
