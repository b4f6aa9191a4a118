//! Scheduling of follow-up invocations.
//!
//! When an invocation suspends, the coordinator asks a [`ContinuationScheduler`]
//! to arrange the next one. Continuations are explicit, inspectable requests:
//! the in-process [`DelayedTaskQueue`] keeps them until due and a
//! [`ContinuationWorker`] drains it, while [`ExternalDispatch`] hands them to a
//! scheduler outside the invocation budget. Failing to schedule never fails
//! the task; the caller can always poll and re-invoke.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::clock::{due_after, Clock};
use crate::collaborators::{CollaboratorError, ExternalScheduler};
use crate::config::{ContinuationConfig, ContinuationStrategy};
use crate::coordinator::{InvocationRequest, InvocationResponse, WorkflowCoordinator};
use crate::observability::workflow_metrics;
use crate::stages::Stage;

pub const CONTINUE_EVENT: &str = "report.continue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    /// Not enough invocation time left to start the next stage.
    TimeBudget,
    /// A stage failed and will be retried after a back-off.
    RetryBackoff,
    /// The inference job is still running.
    AwaitingExternalJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationRequest {
    pub task_id: String,
    pub resume_hint: Option<Stage>,
    pub delay: Duration,
    pub reason: SuspendReason,
}

impl ContinuationRequest {
    pub fn to_invocation(&self) -> InvocationRequest {
        InvocationRequest {
            task_id: self.task_id.clone(),
            resume_hint: self.resume_hint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationChannel {
    InProcessQueue,
    ExternalDispatch,
    CallerPolls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationReceipt {
    pub channel: ContinuationChannel,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] CollaboratorError),

    #[error("dispatch timed out after {0} ms")]
    Timeout(u64),

    #[error("continuation queue is closed")]
    QueueClosed,
}

#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    async fn schedule(&self, request: &ContinuationRequest)
        -> Result<ContinuationReceipt, SchedulerError>;
}

/// A continuation waiting in the in-process queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledContinuation {
    pub request: ContinuationRequest,
    pub due_at: DateTime<Utc>,
}

/// In-process queue of delayed continuations, at most one per task.
///
/// Scheduling a task that is already queued replaces the earlier entry.
pub struct DelayedTaskQueue {
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<String, ScheduledContinuation>>,
    scheduled: Notify,
    closed: AtomicBool,
}

impl DelayedTaskQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(HashMap::new()),
            scheduled: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot of queued continuations ordered by due time.
    pub async fn pending(&self) -> Vec<ScheduledContinuation> {
        let mut entries: Vec<_> = self.pending.lock().await.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.due_at
                .cmp(&b.due_at)
                .then_with(|| a.request.task_id.cmp(&b.request.task_id))
        });
        entries
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.pending.lock().await.values().map(|entry| entry.due_at).min()
    }

    /// Remove and return every continuation due at or before now.
    pub async fn take_due(&self) -> Vec<ContinuationRequest> {
        let now = self.clock.now();
        let mut pending = self.pending.lock().await;

        let due_ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.due_at <= now)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        let mut due: Vec<ScheduledContinuation> = due_ids
            .iter()
            .filter_map(|task_id| pending.remove(task_id))
            .collect();
        due.sort_by_key(|entry| entry.due_at);
        due.into_iter().map(|entry| entry.request).collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.scheduled.notify_waiters();
    }

    async fn wait_for_schedule(&self) {
        self.scheduled.notified().await
    }
}

impl std::fmt::Debug for DelayedTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedTaskQueue").finish_non_exhaustive()
    }
}

#[async_trait]
impl ContinuationScheduler for DelayedTaskQueue {
    async fn schedule(
        &self,
        request: &ContinuationRequest,
    ) -> Result<ContinuationReceipt, SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueClosed);
        }

        let due_at = due_after(self.clock.now(), request.delay);
        let replaced = self.pending.lock().await.insert(
            request.task_id.clone(),
            ScheduledContinuation {
                request: request.clone(),
                due_at,
            },
        );

        debug!(
            task_id = %request.task_id,
            due_at = %due_at,
            replaced = replaced.is_some(),
            "Continuation queued"
        );
        self.scheduled.notify_one();

        Ok(ContinuationReceipt {
            channel: ContinuationChannel::InProcessQueue,
            due_at: Some(due_at),
        })
    }
}

/// Hands continuations to an external scheduler as `report.continue` events.
pub struct ExternalDispatch {
    scheduler: Arc<dyn ExternalScheduler>,
    timeout: Duration,
}

impl ExternalDispatch {
    pub fn new(scheduler: Arc<dyn ExternalScheduler>, timeout: Duration) -> Self {
        Self { scheduler, timeout }
    }
}

#[async_trait]
impl ContinuationScheduler for ExternalDispatch {
    async fn schedule(
        &self,
        request: &ContinuationRequest,
    ) -> Result<ContinuationReceipt, SchedulerError> {
        let payload = json!({
            "task_id": request.task_id,
            "resume_hint": request.resume_hint,
            "delay_secs": request.delay.as_secs(),
            "reason": request.reason,
        });

        tokio::time::timeout(
            self.timeout,
            self.scheduler.dispatch_event(CONTINUE_EVENT, payload),
        )
        .await
        .map_err(|_| SchedulerError::Timeout(self.timeout.as_millis() as u64))??;

        info!(task_id = %request.task_id, "Continuation dispatched");
        Ok(ContinuationReceipt {
            channel: ContinuationChannel::ExternalDispatch,
            due_at: None,
        })
    }
}

/// Schedules nothing; the caller is expected to poll and re-invoke.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerPolls;

#[async_trait]
impl ContinuationScheduler for CallerPolls {
    async fn schedule(
        &self,
        request: &ContinuationRequest,
    ) -> Result<ContinuationReceipt, SchedulerError> {
        debug!(task_id = %request.task_id, "Leaving continuation to the caller");
        Ok(ContinuationReceipt {
            channel: ContinuationChannel::CallerPolls,
            due_at: None,
        })
    }
}

/// Routes in-flight external jobs to the external path and everything else
/// to the fast path, falling back to the other path and then to the caller.
#[derive(Default)]
pub struct LayeredScheduler {
    fast: Option<Arc<dyn ContinuationScheduler>>,
    external: Option<Arc<dyn ContinuationScheduler>>,
}

impl LayeredScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fast_path(mut self, scheduler: Arc<dyn ContinuationScheduler>) -> Self {
        self.fast = Some(scheduler);
        self
    }

    pub fn with_external_path(mut self, scheduler: Arc<dyn ContinuationScheduler>) -> Self {
        self.external = Some(scheduler);
        self
    }
}

#[async_trait]
impl ContinuationScheduler for LayeredScheduler {
    async fn schedule(
        &self,
        request: &ContinuationRequest,
    ) -> Result<ContinuationReceipt, SchedulerError> {
        let (primary, secondary) = match request.reason {
            SuspendReason::AwaitingExternalJob => (&self.external, &self.fast),
            SuspendReason::TimeBudget | SuspendReason::RetryBackoff => (&self.fast, &self.external),
        };

        for scheduler in [primary, secondary].into_iter().flatten() {
            match scheduler.schedule(request).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    workflow_metrics().record_scheduling_fallback();
                    warn!(
                        task_id = %request.task_id,
                        error = %e,
                        "Continuation path failed, trying next"
                    );
                }
            }
        }

        CallerPolls.schedule(request).await
    }
}

/// Build the scheduler selected by `config`.
///
/// Strategies that need an external scheduler degrade to caller polling when
/// none is wired.
pub fn build_scheduler(
    config: &ContinuationConfig,
    queue: Arc<DelayedTaskQueue>,
    external: Option<Arc<dyn ExternalScheduler>>,
) -> Arc<dyn ContinuationScheduler> {
    let dispatch = external.map(|scheduler| {
        Arc::new(ExternalDispatch::new(scheduler, config.dispatch_timeout()))
            as Arc<dyn ContinuationScheduler>
    });

    match (config.strategy, dispatch) {
        (ContinuationStrategy::InProcessQueue, _) => queue as Arc<dyn ContinuationScheduler>,
        (ContinuationStrategy::CallerPolls, _) => Arc::new(CallerPolls),
        (ContinuationStrategy::ExternalDispatch, Some(dispatch)) => dispatch,
        (ContinuationStrategy::ExternalDispatch, None) => {
            warn!("External dispatch selected but no external scheduler configured");
            Arc::new(CallerPolls)
        }
        (ContinuationStrategy::Layered, dispatch) => {
            let layered = LayeredScheduler::new().with_fast_path(queue);
            let layered = match dispatch {
                Some(dispatch) => layered.with_external_path(dispatch),
                None => layered,
            };
            Arc::new(layered)
        }
    }
}

/// Drains a [`DelayedTaskQueue`] by re-invoking the coordinator.
pub struct ContinuationWorker {
    queue: Arc<DelayedTaskQueue>,
    coordinator: Arc<WorkflowCoordinator>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl ContinuationWorker {
    pub fn new(
        queue: Arc<DelayedTaskQueue>,
        coordinator: Arc<WorkflowCoordinator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            coordinator,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Invoke the coordinator for every continuation that is due now.
    pub async fn drain_due(&self) -> Vec<InvocationResponse> {
        let mut responses = Vec::new();
        for request in self.queue.take_due().await {
            debug!(
                task_id = %request.task_id,
                reason = ?request.reason,
                "Running continuation"
            );
            responses.push(self.coordinator.invoke(request.to_invocation()).await);
        }
        responses
    }

    pub async fn run(self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Continuation worker started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Continuation worker shutting down");
                    self.queue.close();
                    break;
                }
                _ = self.queue.wait_for_schedule() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            for response in self.drain_due().await {
                if response.is_error() {
                    error!(message = %response.message, "Continuation ended in error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::MockExternalScheduler;

    fn request(task_id: &str, reason: SuspendReason, delay_secs: u64) -> ContinuationRequest {
        ContinuationRequest {
            task_id: task_id.to_string(),
            resume_hint: Some(Stage::AiInference),
            delay: Duration::from_secs(delay_secs),
            reason,
        }
    }

    struct FailingScheduler;

    #[async_trait]
    impl ContinuationScheduler for FailingScheduler {
        async fn schedule(
            &self,
            _request: &ContinuationRequest,
        ) -> Result<ContinuationReceipt, SchedulerError> {
            Err(SchedulerError::QueueClosed)
        }
    }

    #[tokio::test]
    async fn test_queue_releases_only_due_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = DelayedTaskQueue::new(clock.clone());

        queue
            .schedule(&request("order-a", SuspendReason::TimeBudget, 0))
            .await
            .unwrap();
        queue
            .schedule(&request("order-b", SuspendReason::AwaitingExternalJob, 30))
            .await
            .unwrap();

        let due = queue.take_due().await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, "order-a");
        assert_eq!(queue.len().await, 1);

        clock.advance(Duration::from_secs(30));
        let due = queue.take_due().await;
        assert_eq!(due[0].task_id, "order-b");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_queue_keeps_one_entry_per_task() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = DelayedTaskQueue::new(clock.clone());

        queue
            .schedule(&request("order-a", SuspendReason::RetryBackoff, 60))
            .await
            .unwrap();
        queue
            .schedule(&request("order-a", SuspendReason::TimeBudget, 0))
            .await
            .unwrap();

        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request.reason, SuspendReason::TimeBudget);
        assert_eq!(queue.next_due_at().await, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_queue_accepts_unbounded_delay() {
        let queue = DelayedTaskQueue::new(Arc::new(ManualClock::starting_now()));
        let mut far_future = request("order-a", SuspendReason::RetryBackoff, 0);
        far_future.delay = Duration::MAX;

        let receipt = queue.schedule(&far_future).await.unwrap();
        assert_eq!(receipt.due_at, Some(DateTime::<Utc>::MAX_UTC));
        assert!(queue.take_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_requests() {
        let queue = DelayedTaskQueue::new(Arc::new(ManualClock::starting_now()));
        queue.close();
        let result = queue
            .schedule(&request("order-a", SuspendReason::TimeBudget, 0))
            .await;
        assert!(matches!(result, Err(SchedulerError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_external_dispatch_sends_continue_event() {
        let mut external = MockExternalScheduler::new();
        external
            .expect_dispatch_event()
            .withf(|event, payload| {
                event == CONTINUE_EVENT
                    && payload["task_id"] == "order-x"
                    && payload["resume_hint"] == 3
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatch = ExternalDispatch::new(Arc::new(external), Duration::from_secs(1));
        let receipt = dispatch
            .schedule(&request("order-x", SuspendReason::AwaitingExternalJob, 10))
            .await
            .unwrap();
        assert_eq!(receipt.channel, ContinuationChannel::ExternalDispatch);
    }

    #[tokio::test]
    async fn test_layered_prefers_external_for_jobs() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Arc::new(DelayedTaskQueue::new(clock));
        let mut external = MockExternalScheduler::new();
        external.expect_dispatch_event().returning(|_, _| Ok(()));

        let layered = LayeredScheduler::new()
            .with_fast_path(queue.clone())
            .with_external_path(Arc::new(ExternalDispatch::new(
                Arc::new(external),
                Duration::from_secs(1),
            )));

        let receipt = layered
            .schedule(&request("order-x", SuspendReason::AwaitingExternalJob, 10))
            .await
            .unwrap();
        assert_eq!(receipt.channel, ContinuationChannel::ExternalDispatch);
        assert!(queue.is_empty().await);

        let receipt = layered
            .schedule(&request("order-y", SuspendReason::TimeBudget, 0))
            .await
            .unwrap();
        assert_eq!(receipt.channel, ContinuationChannel::InProcessQueue);
    }

    #[tokio::test]
    async fn test_layered_falls_back_to_other_path_then_caller() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Arc::new(DelayedTaskQueue::new(clock));

        let layered = LayeredScheduler::new()
            .with_fast_path(queue.clone())
            .with_external_path(Arc::new(FailingScheduler));
        let receipt = layered
            .schedule(&request("order-x", SuspendReason::AwaitingExternalJob, 10))
            .await
            .unwrap();
        assert_eq!(receipt.channel, ContinuationChannel::InProcessQueue);

        let broken = LayeredScheduler::new()
            .with_fast_path(Arc::new(FailingScheduler))
            .with_external_path(Arc::new(FailingScheduler));
        let receipt = broken
            .schedule(&request("order-z", SuspendReason::TimeBudget, 0))
            .await
            .unwrap();
        assert_eq!(receipt.channel, ContinuationChannel::CallerPolls);
    }
}
