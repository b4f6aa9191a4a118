use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Process-wide workflow counters
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    pub invocations: AtomicU64,
    pub stages_completed: AtomicU64,
    pub stage_failures: AtomicU64,
    pub stages_skipped: AtomicU64,
    pub regressions: AtomicU64,
    pub suspensions: AtomicU64,
    pub completions: AtomicU64,
    pub failures: AtomicU64,
    pub notification_failures: AtomicU64,
    pub scheduling_fallbacks: AtomicU64,
    pub storage_failures: AtomicU64,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_skipped(&self) {
        self.stages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_regression(&self) {
        self.regressions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_failure(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scheduling_fallback(&self) {
        self.scheduling_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> WorkflowStats {
        WorkflowStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            stages_skipped: self.stages_skipped.load(Ordering::Relaxed),
            regressions: self.regressions.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            scheduling_fallbacks: self.scheduling_fallbacks.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            invocations = stats.invocations,
            stages_completed = stats.stages_completed,
            stage_failures = stats.stage_failures,
            stages_skipped = stats.stages_skipped,
            regressions = stats.regressions,
            suspensions = stats.suspensions,
            completions = stats.completions,
            failures = stats.failures,
            notification_failures = stats.notification_failures,
            scheduling_fallbacks = stats.scheduling_fallbacks,
            storage_failures = stats.storage_failures,
            "Workflow metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowStats {
    pub invocations: u64,
    pub stages_completed: u64,
    pub stage_failures: u64,
    pub stages_skipped: u64,
    pub regressions: u64,
    pub suspensions: u64,
    pub completions: u64,
    pub failures: u64,
    pub notification_failures: u64,
    pub scheduling_fallbacks: u64,
    pub storage_failures: u64,
}

static WORKFLOW_METRICS: std::sync::LazyLock<WorkflowMetrics> =
    std::sync::LazyLock::new(WorkflowMetrics::new);

pub fn workflow_metrics() -> &'static WorkflowMetrics {
    &WORKFLOW_METRICS
}

/// Logs how long a stage took when finished.
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
        duration
    }
}
