// Retry policy for report tasks
// Two independent counters: consecutive failures of the current stage, and
// invocations of the whole task.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};

use crate::checkpoint::Checkpoint;
use crate::stages::StageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failures of one stage before it is skipped.
    pub max_stage_errors: u32,
    /// Invocations a task may consume before it is abandoned.
    pub max_task_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_stage_errors: 3,
            max_task_attempts: 30,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// What to do after a recoverable stage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Suspend and run the same stage again after `delay`.
    RetrySameStage { delay: Duration },
    /// Give up on this stage and move on with its outputs marked empty.
    SkipForward,
}

/// Outcome of counting one more invocation against a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    Proceed,
    Exhausted { attempts: u32, ceiling: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryGovernor {
    config: RetryConfig,
}

impl RetryGovernor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Count an invocation against the task. The counter never resets.
    pub fn record_attempt(&self, checkpoint: &mut Checkpoint) -> AttemptVerdict {
        checkpoint.attempts = checkpoint.attempts.saturating_add(1);

        if checkpoint.attempts > self.config.max_task_attempts {
            error!(
                task_id = %checkpoint.task_id,
                attempts = checkpoint.attempts,
                ceiling = self.config.max_task_attempts,
                stage = checkpoint.current_stage.number(),
                "Task exceeded its attempts ceiling"
            );
            AttemptVerdict::Exhausted {
                attempts: checkpoint.attempts,
                ceiling: self.config.max_task_attempts,
            }
        } else {
            AttemptVerdict::Proceed
        }
    }

    pub fn record_success(&self, checkpoint: &mut Checkpoint) {
        checkpoint.error_count = 0;
        checkpoint.last_error = None;
    }

    /// Count a recoverable failure of the current stage.
    pub fn record_failure(&self, checkpoint: &mut Checkpoint, failure: &StageError) -> FailureVerdict {
        checkpoint.error_count = checkpoint.error_count.saturating_add(1);
        checkpoint.last_error = Some(failure.to_string());

        if checkpoint.error_count < self.config.max_stage_errors {
            let delay = self.backoff_delay(checkpoint.error_count);
            warn!(
                task_id = %checkpoint.task_id,
                stage = checkpoint.current_stage.number(),
                error_count = checkpoint.error_count,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Stage failed, retrying later"
            );
            FailureVerdict::RetrySameStage { delay }
        } else {
            error!(
                task_id = %checkpoint.task_id,
                stage = checkpoint.current_stage.number(),
                error_count = checkpoint.error_count,
                error = %failure,
                "Stage kept failing, skipping forward"
            );
            checkpoint.error_count = 0;
            FailureVerdict::SkipForward
        }
    }

    /// Exponential back-off for the n-th consecutive failure (1-based).
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let raw = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_delay_ms);

        let millis = if self.config.jitter && raw > 0 {
            rand::rng().random_range(raw / 2..=raw)
        } else {
            raw
        };
        Duration::from_millis(millis)
    }
}

impl Default for RetryGovernor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Stage;
    use chrono::Utc;
    use proptest::prelude::*;

    fn governor() -> RetryGovernor {
        RetryGovernor::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        })
    }

    fn transient() -> StageError {
        StageError::Transient {
            stage: Stage::BaselineAnalysis,
            reason: "upstream 503".to_string(),
        }
    }

    #[test]
    fn test_third_failure_skips_forward() {
        let governor = governor();
        let mut checkpoint = Checkpoint::new("order-1", Utc::now());

        assert_eq!(
            governor.record_failure(&mut checkpoint, &transient()),
            FailureVerdict::RetrySameStage {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            governor.record_failure(&mut checkpoint, &transient()),
            FailureVerdict::RetrySameStage {
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(
            governor.record_failure(&mut checkpoint, &transient()),
            FailureVerdict::SkipForward
        );
        assert_eq!(checkpoint.error_count, 0);
        assert!(checkpoint.last_error.is_some());
    }

    #[test]
    fn test_success_resets_stage_counter_only() {
        let governor = governor();
        let mut checkpoint = Checkpoint::new("order-1", Utc::now());
        governor.record_attempt(&mut checkpoint);
        governor.record_failure(&mut checkpoint, &transient());

        governor.record_success(&mut checkpoint);
        assert_eq!(checkpoint.error_count, 0);
        assert_eq!(checkpoint.last_error, None);
        assert_eq!(checkpoint.attempts, 1);
    }

    #[test]
    fn test_attempts_ceiling() {
        let governor = governor();
        let mut checkpoint = Checkpoint::new("order-1", Utc::now());
        checkpoint.attempts = 29;

        assert_eq!(governor.record_attempt(&mut checkpoint), AttemptVerdict::Proceed);
        assert_eq!(
            governor.record_attempt(&mut checkpoint),
            AttemptVerdict::Exhausted {
                attempts: 31,
                ceiling: 30
            }
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let governor = governor();
        assert_eq!(governor.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(governor.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(governor.backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn prop_never_more_than_three_consecutive_attempts(failures in 1usize..50) {
            let governor = governor();
            let mut checkpoint = Checkpoint::new("order-p", Utc::now());
            let mut consecutive = 0u32;

            for _ in 0..failures {
                consecutive += 1;
                match governor.record_failure(&mut checkpoint, &transient()) {
                    FailureVerdict::RetrySameStage { .. } => prop_assert!(consecutive < 3),
                    FailureVerdict::SkipForward => {
                        prop_assert_eq!(consecutive, 3);
                        consecutive = 0;
                    }
                }
            }
        }

        #[test]
        fn prop_jittered_delay_within_bounds(failures in 1u32..20) {
            let governor = RetryGovernor::default();
            let delay = governor.backoff_delay(failures);
            prop_assert!(delay <= Duration::from_millis(governor.config().max_delay_ms));
            prop_assert!(delay >= Duration::from_millis(governor.config().base_delay_ms / 2));
        }
    }
}
