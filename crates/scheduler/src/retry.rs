//! What happens to a command after a failed delivery.

use chrono::{DateTime, Duration, Utc};

/// A deliverer's instruction for a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Let the [`RetryPolicy`] decide.
    Default,
    /// Retry after the given delay, regardless of the attempt count.
    After(Duration),
    /// Abandon the command now.
    GiveUp,
    /// Keep retrying on the policy's backoff, without an attempt limit.
    NeverGiveUp,
}

/// Where a failed command goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    Abandon,
}

/// Attempt limit and backoff for [`RetryDirective::Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a failing command is abandoned.
    pub max_attempts: i32,
    /// Backoff unit; attempt `n` waits `n * n` units.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit: Duration::minutes(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempts` failed attempts. Saturates at
    /// [`Duration::MAX`].
    pub fn backoff(&self, attempts: i32) -> Duration {
        let n = attempts.max(1);
        n.checked_mul(n)
            .and_then(|squared| self.backoff_unit.checked_mul(squared))
            .unwrap_or(Duration::MAX)
    }

    /// Applies `directive` to a command that has failed `attempts` times,
    /// `now` being the time of the command's clock.
    ///
    /// A retry time past the representable range abandons the command.
    pub fn decide(&self, directive: RetryDirective, attempts: i32, now: DateTime<Utc>) -> RetryDecision {
        let retry_after = |delay: Duration| {
            now.checked_add_signed(delay)
                .map_or(RetryDecision::Abandon, RetryDecision::RetryAt)
        };
        match directive {
            RetryDirective::GiveUp => RetryDecision::Abandon,
            RetryDirective::After(delay) => retry_after(delay),
            RetryDirective::NeverGiveUp => retry_after(self.backoff(attempts)),
            RetryDirective::Default if attempts >= self.max_attempts => RetryDecision::Abandon,
            RetryDirective::Default => retry_after(self.backoff(attempts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_quadratic_in_minutes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::minutes(1));
        assert_eq!(policy.backoff(2), Duration::minutes(4));
        assert_eq!(policy.backoff(3), Duration::minutes(9));
    }

    #[test]
    fn default_directive_gives_up_at_the_limit() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(
            policy.decide(RetryDirective::Default, 4, now),
            RetryDecision::RetryAt(now + Duration::minutes(16))
        );
        assert_eq!(policy.decide(RetryDirective::Default, 5, now), RetryDecision::Abandon);
    }

    #[test]
    fn explicit_directives_override_the_limit() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(
            policy.decide(RetryDirective::After(Duration::seconds(30)), 50, now),
            RetryDecision::RetryAt(now + Duration::seconds(30))
        );
        assert!(matches!(
            policy.decide(RetryDirective::NeverGiveUp, 50, now),
            RetryDecision::RetryAt(_)
        ));
        assert_eq!(policy.decide(RetryDirective::GiveUp, 1, now), RetryDecision::Abandon);
    }

    #[test]
    fn huge_delays_do_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: i32::MAX,
            backoff_unit: Duration::days(365),
        };
        let now = Utc::now();
        assert_eq!(policy.backoff(i32::MAX), Duration::MAX);
        assert_eq!(policy.decide(RetryDirective::NeverGiveUp, 100_000, now), RetryDecision::Abandon);
        assert_eq!(
            policy.decide(RetryDirective::After(Duration::MAX), 1, now),
            RetryDecision::Abandon
        );
    }
}
