//! Failure classification and recovery decisions
//!
//! When a step fails, the classifier consults the step's error policy and
//! produces a single recovery decision: retry with a backoff delay, divert to
//! a fallback step, continue with an empty default output, or fail the flow.
//! Platform-level bounds clamp per-step policies so no flow author can
//! configure an unbounded retry storm.

use crate::domain::flow_definition::{ErrorPolicy, StepId};
use crate::error::{EngineError, ErrorKind};
use std::time::Duration;

/// Platform-wide caps applied on top of per-step error policies
#[derive(Debug, Clone)]
pub struct RetryBounds {
    /// Hard ceiling on attempts, regardless of what a policy asks for
    pub max_total_attempts: u32,

    /// Hard ceiling on a single backoff delay
    pub max_interval: Duration,
}

impl Default for RetryBounds {
    fn default() -> Self {
        Self {
            max_total_attempts: 25,
            max_interval: Duration::from_secs(3600),
        }
    }
}

/// What the engine does next after a step failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch the same step after the delay
    Retry {
        /// Backoff delay before the next attempt
        delay: Duration,
    },

    /// Divert execution to the policy's fallback step
    Fallback {
        /// Step to divert to
        step: StepId,
    },

    /// Record an empty default output and take the normal transition path
    ContinueWithDefault,

    /// Fail the flow
    Fail,
}

/// Turns a step failure plus its error policy into a recovery decision
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    bounds: RetryBounds,
}

impl ErrorClassifier {
    /// Create a classifier with the given platform bounds
    pub fn new(bounds: RetryBounds) -> Self {
        Self { bounds }
    }

    /// Decide how to recover from a failure on the given attempt.
    ///
    /// `attempt` is the 1-based number of the attempt that just failed;
    /// `content_attempt` counts content-kind failures separately because
    /// content errors draw from their own budget. Decision order: cancellation
    /// always fails, then retry if the error is retryable and budget remains,
    /// then fallback if configured, then continue-with-default, then fail.
    pub fn decide(
        &self,
        policy: &ErrorPolicy,
        error: &EngineError,
        attempt: u32,
        content_attempt: u32,
    ) -> RetryDecision {
        let kind = error.kind();

        if kind == ErrorKind::Cancellation {
            return RetryDecision::Fail;
        }

        if self.retry_allowed(policy, error, attempt, content_attempt) {
            return RetryDecision::Retry {
                delay: self.backoff_delay(policy, attempt),
            };
        }

        if let Some(step) = &policy.fallback_step {
            return RetryDecision::Fallback { step: step.clone() };
        }

        if policy.continue_on_failure {
            return RetryDecision::ContinueWithDefault;
        }

        RetryDecision::Fail
    }

    fn retry_allowed(
        &self,
        policy: &ErrorPolicy,
        error: &EngineError,
        attempt: u32,
        content_attempt: u32,
    ) -> bool {
        let main_budget_remains = attempt < policy.max_attempts.min(self.bounds.max_total_attempts);

        match error.kind() {
            ErrorKind::Transient => main_budget_remains,
            ErrorKind::Content => {
                content_attempt < policy.content_retry_budget.min(self.bounds.max_total_attempts)
            }
            ErrorKind::Cancellation => false,
            // Configuration and validation defects do not heal with time,
            // unless the policy explicitly allow-lists the error name
            _ => {
                main_budget_remains
                    && policy.retry_on.iter().any(|name| name == error.name())
            }
        }
    }

    /// Exponential backoff: `interval * rate^(attempt - 1)`, clamped to the
    /// platform ceiling. Attempt 1 waits the base interval.
    pub fn backoff_delay(&self, policy: &ErrorPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = policy.backoff_rate.max(1.0).powi(exponent as i32);
        let secs = policy.retry_interval_secs.max(0.0) * factor;

        let delay = if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.bounds.max_interval.as_secs_f64()))
        } else {
            self.bounds.max_interval
        };
        delay.min(self.bounds.max_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ErrorPolicy {
        ErrorPolicy {
            max_attempts: 5,
            retry_interval_secs: 5.0,
            backoff_rate: 2.0,
            content_retry_budget: 0,
            retry_on: Vec::new(),
            fallback_step: None,
            continue_on_failure: false,
        }
    }

    #[test]
    fn test_backoff_delay_at_third_attempt() {
        let classifier = ErrorClassifier::default();
        let decision = classifier.decide(
            &policy(),
            &EngineError::Transient("socket reset".to_string()),
            3,
            0,
        );

        // 5s base, rate 2.0: attempt 3 waits 5 * 2^2 = 20s
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_secs(20)
            }
        );
    }

    #[test]
    fn test_first_retry_waits_base_interval() {
        let classifier = ErrorClassifier::default();
        let delay = classifier.backoff_delay(&policy(), 1);
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_delay_clamped_to_platform_ceiling() {
        let classifier = ErrorClassifier::new(RetryBounds {
            max_total_attempts: 25,
            max_interval: Duration::from_secs(60),
        });
        let mut p = policy();
        p.max_attempts = 20;

        let delay = classifier.backoff_delay(&p, 10);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_attempts_clamped_to_platform_ceiling() {
        let classifier = ErrorClassifier::new(RetryBounds {
            max_total_attempts: 3,
            max_interval: Duration::from_secs(3600),
        });
        let mut p = policy();
        p.max_attempts = 100;

        let err = EngineError::Transient("still flaky".to_string());
        assert!(matches!(
            classifier.decide(&p, &err, 2, 0),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(classifier.decide(&p, &err, 3, 0), RetryDecision::Fail);
    }

    #[test]
    fn test_exhausted_budget_without_fallback_fails() {
        let classifier = ErrorClassifier::default();
        let decision = classifier.decide(
            &policy(),
            &EngineError::Transient("socket reset".to_string()),
            5,
            0,
        );
        assert_eq!(decision, RetryDecision::Fail);
    }

    #[test]
    fn test_exhausted_budget_diverts_to_fallback() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.fallback_step = Some(StepId("notify_support".to_string()));

        let decision = classifier.decide(
            &p,
            &EngineError::Transient("socket reset".to_string()),
            5,
            0,
        );
        assert_eq!(
            decision,
            RetryDecision::Fallback {
                step: StepId("notify_support".to_string())
            }
        );
    }

    #[test]
    fn test_fallback_applies_to_non_retryable_kinds() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.fallback_step = Some(StepId("notify_support".to_string()));

        let decision = classifier.decide(
            &p,
            &EngineError::Validation("bad payload shape".to_string()),
            1,
            0,
        );
        assert!(matches!(decision, RetryDecision::Fallback { .. }));
    }

    #[test]
    fn test_continue_on_failure() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.max_attempts = 1;
        p.continue_on_failure = true;

        let decision = classifier.decide(
            &p,
            &EngineError::Validation("bad payload shape".to_string()),
            1,
            0,
        );
        assert_eq!(decision, RetryDecision::ContinueWithDefault);
    }

    #[test]
    fn test_exhausted_transient_retries_continue_on_failure() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.continue_on_failure = true;

        let err = EngineError::Transient("socket reset".to_string());
        // Budget remains: retry still wins over continue
        assert!(matches!(
            classifier.decide(&p, &err, 4, 0),
            RetryDecision::Retry { .. }
        ));
        // Budget exhausted, no fallback configured: continue with default
        assert_eq!(
            classifier.decide(&p, &err, 5, 0),
            RetryDecision::ContinueWithDefault
        );
    }

    #[test]
    fn test_validation_errors_never_retry() {
        let classifier = ErrorClassifier::default();
        let decision = classifier.decide(
            &policy(),
            &EngineError::Validation("bad payload shape".to_string()),
            1,
            0,
        );
        assert_eq!(decision, RetryDecision::Fail);
    }

    #[test]
    fn test_cancellation_never_retries_or_falls_back() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.fallback_step = Some(StepId("notify_support".to_string()));
        p.continue_on_failure = true;

        let decision = classifier.decide(&p, &EngineError::Cancelled, 1, 0);
        assert_eq!(decision, RetryDecision::Fail);
    }

    #[test]
    fn test_content_errors_use_separate_budget() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.max_attempts = 1;
        p.content_retry_budget = 2;

        let err = EngineError::Content("malformed upstream document".to_string());
        assert!(matches!(
            classifier.decide(&p, &err, 1, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            classifier.decide(&p, &err, 2, 1),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(classifier.decide(&p, &err, 3, 2), RetryDecision::Fail);
    }

    #[test]
    fn test_retry_on_allow_list_expands_retryability() {
        let classifier = ErrorClassifier::default();
        let mut p = policy();
        p.retry_on = vec!["Validation".to_string()];

        // Normally fatal, but the policy names this error explicitly
        let validation = EngineError::Validation("bad payload shape".to_string());
        assert!(matches!(
            classifier.decide(&p, &validation, 1, 0),
            RetryDecision::Retry { .. }
        ));
        // The main attempt budget still applies
        assert_eq!(classifier.decide(&p, &validation, 5, 0), RetryDecision::Fail);

        // The allow-list never restricts transient retries
        let transient = EngineError::Transient("socket reset".to_string());
        assert!(matches!(
            classifier.decide(&p, &transient, 1, 0),
            RetryDecision::Retry { .. }
        ));
    }
}
