use crate::error::EngineError;
use std::time::Duration;

/// Outcome of consulting the retry policy after a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter `InProgress` after the delay
    Retry { delay: Duration },
    /// Transition to `Failed`
    GiveUp,
}

/// Fixed-delay retry policy for transient failures.
///
/// `max_retries` bounds re-attempts beyond the first: with `max_retries = 3`
/// a transfer runs at most 4 attempts. Non-transient errors bypass the policy
/// entirely.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
        }
    }

    /// Decide what to do after `attempt` failed with `error`
    pub fn decide(&self, attempt: u32, error: &EngineError) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::GiveUp;
        }
        if attempt <= self.max_retries {
            RetryDecision::Retry {
                delay: self.retry_delay,
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_within_budget_retries() {
        let policy = RetryPolicy::new(3, 250);
        let err = EngineError::transient("timeout");

        assert_eq!(
            policy.decide(1, &err),
            RetryDecision::Retry {
                delay: Duration::from_millis(250)
            }
        );
        assert_eq!(
            policy.decide(3, &err),
            RetryDecision::Retry {
                delay: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn test_budget_exhausted_gives_up() {
        let policy = RetryPolicy::new(3, 250);
        let err = EngineError::transient("timeout");
        assert_eq!(policy.decide(4, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_transient_bypasses_budget() {
        let policy = RetryPolicy::new(10, 250);
        assert_eq!(
            policy.decide(1, &EngineError::fatal("disk full")),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(1, &EngineError::unreachable("refused")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_zero_retries_fails_first_transient() {
        let policy = RetryPolicy::new(0, 100);
        let err = EngineError::transient("reset");
        assert_eq!(policy.decide(1, &err), RetryDecision::GiveUp);
        assert_eq!(policy.max_attempts(), 1);
    }
}
