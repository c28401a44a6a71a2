//! Retry policy shared by every store's `fail()`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{clock::add_saturating, errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(Error::Config(format!("unknown retry backoff: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub strategy: RetryStrategy,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            strategy: RetryStrategy::Fixed,
            max_delay: Duration::from_secs(300),
        }
    }
}

/// What `fail()` should do with a processing action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailDecision {
    /// Back to pending, reclaimable from `not_before`.
    Retry {
        attempt_count: u32,
        not_before: DateTime<Utc>,
    },
    /// Terminal `failed`.
    GiveUp,
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt_count` earlier failures.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::Fixed => self.retry_delay,
            RetryStrategy::Exponential => self
                .retry_delay
                .checked_mul(1u32 << attempt_count.min(20))
                .unwrap_or(self.max_delay),
        };
        raw.min(self.max_delay)
    }

    pub fn decide(&self, attempt_count: u32, retryable: bool, now: DateTime<Utc>) -> FailDecision {
        if !retryable || attempt_count >= self.max_retries {
            return FailDecision::GiveUp;
        }
        FailDecision::Retry {
            attempt_count: attempt_count + 1,
            not_before: add_saturating(now, self.delay_for(attempt_count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn retryable_failures_retry_until_max_then_give_up() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.decide(0, true, now()),
            FailDecision::Retry { attempt_count: 1, .. }
        ));
        assert!(matches!(
            policy.decide(1, true, now()),
            FailDecision::Retry { attempt_count: 2, .. }
        ));
        assert_eq!(policy.decide(2, true, now()), FailDecision::GiveUp);
    }

    #[test]
    fn permanent_failure_gives_up_immediately() {
        assert_eq!(
            RetryPolicy::default().decide(0, false, now()),
            FailDecision::GiveUp
        );
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
            strategy: RetryStrategy::Exponential,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));

        match policy.decide(1, true, now()) {
            FailDecision::Retry { not_before, .. } => {
                assert_eq!(not_before, now() + chrono::Duration::seconds(2));
            }
            FailDecision::GiveUp => panic!("expected retry"),
        }
    }

    #[test]
    fn huge_delay_clamps_not_before() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_secs(u64::MAX),
            strategy: RetryStrategy::Fixed,
            max_delay: Duration::from_secs(u64::MAX),
        };
        match policy.decide(0, true, now()) {
            FailDecision::Retry { not_before, .. } => {
                assert_eq!(not_before, DateTime::<Utc>::MAX_UTC);
            }
            FailDecision::GiveUp => panic!("expected retry"),
        }
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!(RetryStrategy::parse("Exponential").unwrap(), RetryStrategy::Exponential);
        assert!(RetryStrategy::parse("linear").is_err());
    }
}
