//! Retry policies for node tasks
//!
//! A node's task output that failed is retried per the node's policy. The
//! schedule is fully deterministic — no jitter — because retry timing feeds
//! nothing observable (sleeps go through the injected clock) while attempt
//! counts do: attempt ids appear in event ids, so two runs with identical
//! inputs must make identical retry decisions.
//!
//! Retry discards the failed attempt's output entirely; only the final
//! attempt's result (success or failure) reaches commit.

use crate::error::{Result, RuntimeError};
use std::time::Duration;

/// Per-node retry policy
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Fail the task on the first error
    None,
    /// Deterministic exponential backoff
    ExponentialBackoff {
        /// Delay before the first retry, in nanoseconds
        initial_ns: u64,
        /// Multiplier applied per subsequent retry (≥ 1.0)
        factor: f64,
        /// Total attempts allowed, including the first (≥ 1)
        max_attempts: u32,
        /// Cap on the sum of all backoff sleeps, in nanoseconds
        max_cumulative_ns: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Validate policy parameters (run at graph compilation)
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::None => Ok(()),
            Self::ExponentialBackoff {
                factor,
                max_attempts,
                ..
            } => {
                if *max_attempts < 1 {
                    return Err(RuntimeError::GraphValidation(
                        "retry policy: max_attempts must be >= 1".to_string(),
                    ));
                }
                if !factor.is_finite() || *factor < 1.0 {
                    return Err(RuntimeError::GraphValidation(
                        "retry policy: factor must be finite and >= 1.0".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Delay to sleep before retrying after `failed_attempt` (0-based)
    ///
    /// Returns `None` when the policy is exhausted: attempts used up, or the
    /// cumulative sleep budget would be exceeded.
    pub fn delay_before_retry(&self, failed_attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::ExponentialBackoff {
                initial_ns,
                factor,
                max_attempts,
                max_cumulative_ns,
            } => {
                let next_attempt = failed_attempt + 1;
                if next_attempt >= *max_attempts {
                    return None;
                }
                let delay_ns = backoff_ns(*initial_ns, *factor, failed_attempt);
                let cumulative: u64 = (0..=failed_attempt)
                    .map(|a| backoff_ns(*initial_ns, *factor, a))
                    .sum();
                if cumulative > *max_cumulative_ns {
                    return None;
                }
                Some(Duration::from_nanos(delay_ns))
            }
        }
    }

    /// Canonical encoding for the graph version digest
    pub fn digest_bytes(&self) -> Vec<u8> {
        match self {
            Self::None => vec![0u8],
            Self::ExponentialBackoff {
                initial_ns,
                factor,
                max_attempts,
                max_cumulative_ns,
            } => {
                let mut out = Vec::with_capacity(1 + 8 + 8 + 4 + 8);
                out.push(1u8);
                out.extend_from_slice(&initial_ns.to_be_bytes());
                out.extend_from_slice(&factor.to_bits().to_be_bytes());
                out.extend_from_slice(&max_attempts.to_be_bytes());
                out.extend_from_slice(&max_cumulative_ns.to_be_bytes());
                out
            }
        }
    }
}

fn backoff_ns(initial_ns: u64, factor: f64, attempt: u32) -> u64 {
    let scaled = (initial_ns as f64) * factor.powi(attempt as i32);
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::ExponentialBackoff {
            initial_ns: 1_000,
            factor: 2.0,
            max_attempts,
            max_cumulative_ns: 1_000_000,
        }
    }

    #[test]
    fn test_none_never_retries() {
        assert_eq!(RetryPolicy::None.delay_before_retry(0), None);
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        let p = policy(4);
        assert_eq!(p.delay_before_retry(0), Some(Duration::from_nanos(1_000)));
        assert_eq!(p.delay_before_retry(1), Some(Duration::from_nanos(2_000)));
        assert_eq!(p.delay_before_retry(2), Some(Duration::from_nanos(4_000)));
        // attempt 3 was the last allowed
        assert_eq!(p.delay_before_retry(3), None);
    }

    #[test]
    fn test_cumulative_budget_exhausts() {
        let p = RetryPolicy::ExponentialBackoff {
            initial_ns: 1_000,
            factor: 2.0,
            max_attempts: 100,
            max_cumulative_ns: 2_500,
        };
        // 1000 <= 2500 ok; 1000 + 2000 = 3000 > 2500 stops
        assert!(p.delay_before_retry(0).is_some());
        assert_eq!(p.delay_before_retry(1), None);
    }

    #[test]
    fn test_validation() {
        assert!(policy(1).validate().is_ok());
        assert!(policy(0).validate().is_err());
        let bad = RetryPolicy::ExponentialBackoff {
            initial_ns: 0,
            factor: 0.5,
            max_attempts: 3,
            max_cumulative_ns: 0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_digest_bytes_distinguish_policies() {
        assert_ne!(RetryPolicy::None.digest_bytes(), policy(3).digest_bytes());
        assert_ne!(policy(3).digest_bytes(), policy(4).digest_bytes());
        assert_eq!(policy(3).digest_bytes(), policy(3).digest_bytes());
    }
}
