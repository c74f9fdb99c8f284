//! Retry policies for stages that call flaky external services
//!
//! A node may carry a [`RetryPolicy`]. When its stage fails with a retryable
//! [`StageError`] the executor waits for the computed backoff and invokes the
//! stage again, on the same input snapshot. Only after the last attempt fails is
//! an [`ErrorRecord`](crate::error::ErrorRecord) written.
//!
//! ```text
//! delay(attempt) = min(initial × factor^attempt, max_interval) × jitter
//! jitter         = 1.0, or uniform in [0.5, 1.5] when enabled
//! ```
//!
//! Cancellation and nested-workflow failures are never retried: the former must
//! stop promptly and the latter already reports a settled child run.
//!
//! # Examples
//!
//! ```rust
//! use stagegraph_core::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(4)
//!     .with_initial_interval(0.5)
//!     .with_backoff_factor(2.0)
//!     .with_jitter(false);
//!
//! assert_eq!(policy.calculate_delay(0), Duration::from_millis(500));
//! assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
//! assert!(policy.should_retry(3));
//! assert!(!policy.should_retry(4));
//! ```

use crate::error::{GraphError, Result, StageError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration for a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,

    /// Delay before the first retry, in seconds
    pub initial_interval: f64,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Upper bound on any single delay, in seconds
    pub max_interval: f64,

    /// Randomise delays to avoid synchronized retries
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 30.0,
            jitter: true,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds.max(0.0);
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds.max(0.0);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based)
    ///
    /// Saturates at `Duration::MAX` and never goes below zero, even for a
    /// policy that skipped [`validate`](Self::validate).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval);

        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        if delay.is_nan() || delay <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    }

    /// Reject intervals and factors that cannot produce a sane delay
    ///
    /// Deserialised policies bypass the clamping builders, so loaders call
    /// this before a policy reaches the executor.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("initial_interval", self.initial_interval),
            ("max_interval", self.max_interval),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(GraphError::Configuration(format!(
                    "retry {} must be a finite, non-negative number of seconds (got {})",
                    field, value
                )));
            }
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(GraphError::Configuration(format!(
                "retry backoff_factor must be finite and at least 1.0 (got {})",
                self.backoff_factor
            )));
        }
        if self.max_attempts == 0 {
            return Err(GraphError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// [`validate`](Self::validate) with the owning node named in the error
    pub fn validate_for(&self, node: &str) -> Result<()> {
        self.validate().map_err(|err| match err {
            GraphError::Configuration(msg) => {
                GraphError::Configuration(format!("node '{}': {}", node, msg))
            }
            other => other,
        })
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Whether this failure is worth another attempt at all
    pub fn is_retryable(&self, error: &StageError) -> bool {
        !matches!(error, StageError::Cancelled | StageError::Subworkflow { .. })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Attempt bookkeeping for one stage invocation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: usize,
    pub last_error: Option<StageError>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failed attempt and keep its error
    pub fn record_failure(&mut self, error: StageError) -> &StageError {
        self.attempts += 1;
        self.last_error.insert(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(3.0)
            .with_max_interval(20.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0).as_secs_f64(), 1.0);
        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 3.0);
        assert_eq!(policy.calculate_delay(2).as_secs_f64(), 9.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 20.0);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(2.0)
            .with_backoff_factor(1.0);

        for _ in 0..50 {
            let delay = policy.calculate_delay(1).as_secs_f64();
            assert!((1.0..=3.0).contains(&delay), "delay out of range: {}", delay);
        }
    }

    #[test]
    fn test_retryable_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&StageError::failed("flaky")));
        assert!(policy.is_retryable(&StageError::generation("rate_limited", "429")));
        assert!(!policy.is_retryable(&StageError::Cancelled));
        assert!(!policy.is_retryable(&StageError::Subworkflow {
            graph: "child".to_string(),
            summary: "1 error(s)".to_string(),
        }));
    }

    #[test]
    fn test_retry_state() {
        let mut state = RetryState::new();
        state.record_failure(StageError::failed("one"));
        state.record_failure(StageError::failed("two"));
        assert_eq!(state.attempts, 2);
        assert_eq!(state.last_error, Some(StageError::failed("two")));
    }

    #[test]
    fn test_validate_rejects_bad_intervals() {
        let negative: RetryPolicy =
            serde_yaml::from_str("initial_interval: -1.0\njitter: false").unwrap();
        let err = negative.validate().unwrap_err();
        assert!(err.to_string().contains("initial_interval"));

        let negative_cap: RetryPolicy = serde_yaml::from_str("max_interval: -0.5").unwrap();
        assert!(negative_cap.validate().is_err());

        let shrinking: RetryPolicy = serde_yaml::from_str("backoff_factor: 0.5").unwrap();
        assert!(shrinking.validate().is_err());

        let no_attempts: RetryPolicy = serde_yaml::from_str("max_attempts: 0").unwrap();
        assert!(no_attempts.validate().is_err());

        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_delay_never_panics_on_unvalidated_policy() {
        let negative: RetryPolicy =
            serde_yaml::from_str("initial_interval: -1.0\njitter: false").unwrap();
        assert_eq!(negative.calculate_delay(0), Duration::ZERO);

        let huge = RetryPolicy::new(3)
            .with_initial_interval(1.0e300)
            .with_max_interval(f64::MAX)
            .with_jitter(false);
        assert_eq!(huge.calculate_delay(5), Duration::MAX);

        let unbounded = RetryPolicy {
            max_interval: f64::INFINITY,
            ..RetryPolicy::default().with_jitter(false)
        };
        assert_eq!(unbounded.calculate_delay(usize::MAX), Duration::MAX);
    }

    #[test]
    fn test_policy_from_partial_yaml() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5\njitter: false").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert!(!policy.jitter);
        assert_eq!(policy.backoff_factor, 2.0);
    }
}
