//! Failure classification and retry policy.

use crate::config::RetryConfig;
use crate::error::ExecutionError;
use crate::models::ModuleDescriptor;
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Run another attempt after `delay`.
    Retry { delay: Duration },
    /// Give up on the module; dependents that require it are skipped.
    SkipDependents,
    /// Give up on the whole run.
    AbortRun,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else if secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Decides retry, skip or abort for each failed attempt.
#[derive(Debug, Clone, Default)]
pub struct RecoveryController {
    policy: RetryPolicy,
}

impl RecoveryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify the failure of attempt number `attempt`.
    pub fn classify(
        &self,
        error: &ExecutionError,
        attempt: u32,
        descriptor: &ModuleDescriptor,
    ) -> RecoveryAction {
        let retryable = match error {
            ExecutionError::Cancelled { .. } => return RecoveryAction::AbortRun,
            ExecutionError::Timeout { .. } => true,
            ExecutionError::BackendUnavailable { transient, .. } => *transient,
            ExecutionError::Fault { .. } => false,
        };

        if retryable && attempt < self.policy.max_attempts {
            return RecoveryAction::Retry {
                delay: self.policy.backoff(attempt),
            };
        }

        if descriptor.critical {
            RecoveryAction::AbortRun
        } else {
            RecoveryAction::SkipDependents
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendKind, Phase, ResourceHints};

    fn descriptor(critical: bool) -> ModuleDescriptor {
        ModuleDescriptor {
            id: "P50".to_string(),
            name: "binwalk".to_string(),
            description: String::new(),
            phase: Phase::PreExtract,
            backend: BackendKind::Container,
            depends_on: Default::default(),
            soft_depends_on: Default::default(),
            hints: ResourceHints::default(),
            timeout: Duration::from_secs(1),
            critical,
        }
    }

    fn timeout() -> ExecutionError {
        ExecutionError::Timeout {
            module: "P50".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    fn controller(max_attempts: u32) -> RecoveryController {
        RecoveryController::new(RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
        })
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = controller(5).policy().clone();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_timeout_retried_until_exhausted() {
        let c = controller(2);
        assert_eq!(
            c.classify(&timeout(), 1, &descriptor(false)),
            RecoveryAction::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            c.classify(&timeout(), 2, &descriptor(false)),
            RecoveryAction::SkipDependents
        );
        assert_eq!(
            c.classify(&timeout(), 2, &descriptor(true)),
            RecoveryAction::AbortRun
        );
    }

    #[test]
    fn test_fault_never_retried() {
        let fault = ExecutionError::Fault {
            module: "P50".to_string(),
            reason: "exit 1".to_string(),
            status: Some(1),
        };
        assert_eq!(
            controller(5).classify(&fault, 1, &descriptor(false)),
            RecoveryAction::SkipDependents
        );
    }

    #[test]
    fn test_backend_unavailable_transience() {
        let unavailable = |transient| ExecutionError::BackendUnavailable {
            module: "P50".to_string(),
            reason: "no daemon".to_string(),
            transient,
        };
        assert!(matches!(
            controller(3).classify(&unavailable(true), 1, &descriptor(false)),
            RecoveryAction::Retry { .. }
        ));
        assert_eq!(
            controller(3).classify(&unavailable(false), 1, &descriptor(true)),
            RecoveryAction::AbortRun
        );
    }

    #[test]
    fn test_cancel_aborts() {
        let cancelled = ExecutionError::Cancelled {
            module: "P60".to_string(),
        };
        assert_eq!(
            controller(3).classify(&cancelled, 1, &descriptor(false)),
            RecoveryAction::AbortRun
        );
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
    }
}
