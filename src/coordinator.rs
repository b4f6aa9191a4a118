//! Workflow coordinator.
//!
//! One invocation loads the order and its checkpoint, runs as many stages as
//! the invocation budget allows, and then either finishes the order, fails
//! it, or persists the checkpoint and schedules a continuation. Invocations
//! for the same task may overlap; they are not locked against each other.
//! Correctness comes from the terminal-status check on entry, full-overwrite
//! checkpoint writes, and the status-guarded `generating → completed` write
//! that decides which invocation delivers the notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::clock::{Clock, InvocationBudget};
use crate::collaborators::{Collaborators, NotificationPayload};
use crate::config::WorkflowConfig;
use crate::continuation::{ContinuationRequest, ContinuationScheduler, SuspendReason};
use crate::inference::AsyncJobPoller;
use crate::observability::{workflow_metrics, OperationTimer};
use crate::orders::{Order, OrderError, OrderEvent, OrderStateMachine, OrderStatus, OrderStore, OrderUpdate};
use crate::retry::{AttemptVerdict, FailureVerdict, RetryGovernor};
use crate::stages::{Stage, StageContext, StageError, StageExecutor, StageOutcome, ARTIFACT_REF};
use crate::telemetry::{create_invocation_span, create_stage_span, generate_correlation_id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub task_id: String,
    #[serde(default)]
    pub resume_hint: Option<Stage>,
}

impl InvocationRequest {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            resume_hint: None,
        }
    }

    pub fn with_resume_hint(mut self, stage: Stage) -> Self {
        self.resume_hint = Some(stage);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Completed,
    Continuing,
    WaitingExternal,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub status: InvocationStatus,
    pub next_stage: Option<Stage>,
    pub elapsed_ms: u64,
    pub message: String,
    pub progress_percent: u8,
    pub report_ref: Option<String>,
}

impl InvocationResponse {
    fn completed(report_ref: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Completed,
            next_stage: None,
            elapsed_ms: 0,
            message: message.into(),
            progress_percent: 100,
            report_ref,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Error,
            next_stage: None,
            elapsed_ms: 0,
            message: message.into(),
            progress_percent: 0,
            report_ref: None,
        }
    }

    fn suspended(stage: Stage, reason: SuspendReason, message: impl Into<String>) -> Self {
        let status = match reason {
            SuspendReason::AwaitingExternalJob => InvocationStatus::WaitingExternal,
            SuspendReason::TimeBudget | SuspendReason::RetryBackoff => InvocationStatus::Continuing,
        };
        Self {
            status,
            next_stage: Some(stage),
            elapsed_ms: 0,
            message: message.into(),
            progress_percent: stage.progress_percent(),
            report_ref: None,
        }
    }

    /// Response for an order that already reached a terminal status.
    fn for_terminal(order: &Order) -> Self {
        match order.status {
            OrderStatus::Completed => {
                Self::completed(order.report_ref.clone(), "report already delivered")
            }
            _ => Self::error(
                order
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("order is {}", order.status)),
            ),
        }
    }

    /// Storage failed mid-run; the task is intact and will be retried.
    fn interrupted(stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Continuing,
            next_stage: stage,
            elapsed_ms: 0,
            message: message.into(),
            progress_percent: stage.map(Stage::progress_percent).unwrap_or(0),
            report_ref: None,
        }
    }

    fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == InvocationStatus::Error
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            InvocationStatus::Completed | InvocationStatus::Error
        )
    }
}

/// Storage failures that end an invocation without touching the order.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("checkpoint storage failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("order storage failed: {0}")]
    Order(#[from] OrderError),
}

pub struct WorkflowCoordinator {
    orders: Arc<dyn OrderStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    collaborators: Collaborators,
    executor: StageExecutor,
    scheduler: Arc<dyn ContinuationScheduler>,
    governor: RetryGovernor,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
}

impl WorkflowCoordinator {
    pub fn new(
        collaborators: Collaborators,
        orders: Arc<dyn OrderStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        scheduler: Arc<dyn ContinuationScheduler>,
        clock: Arc<dyn Clock>,
        config: WorkflowConfig,
    ) -> Self {
        let poller = AsyncJobPoller::new(
            collaborators.inference.clone(),
            clock.clone(),
            config.inference.clone(),
        );
        let executor = StageExecutor::new(collaborators.clone(), poller);
        let governor = RetryGovernor::new(config.retry.clone());

        Self {
            orders,
            checkpoints,
            collaborators,
            executor,
            scheduler,
            governor,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Entry point for one invocation. Never fails; problems are reported in
    /// the response.
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        let correlation_id = generate_correlation_id();
        let span = create_invocation_span(
            &request.task_id,
            request.resume_hint.map(Stage::number),
            &correlation_id,
        );

        async {
            workflow_metrics().record_invocation();
            let budget = InvocationBudget::start(&*self.clock, self.config.invocation_budget());

            let response = match self.run(&request, &budget).await {
                Ok(response) => response,
                Err(e) => self.interrupted(&request, e).await,
            };

            let response = response.with_elapsed(budget.elapsed(&*self.clock));
            info!(
                task_id = %request.task_id,
                status = ?response.status,
                next_stage = response.next_stage.map(Stage::number),
                elapsed_ms = response.elapsed_ms,
                "Invocation finished"
            );
            response
        }
        .instrument(span)
        .await
    }

    /// Answer a storage failure with a back-off continuation instead of an
    /// error, so the task is picked up again once storage recovers.
    async fn interrupted(
        &self,
        request: &InvocationRequest,
        failure: CoordinatorError,
    ) -> InvocationResponse {
        workflow_metrics().record_storage_failure();

        let stage = match self.checkpoints.get(&request.task_id).await {
            Ok(Some(checkpoint)) => Some(checkpoint.current_stage),
            _ => request.resume_hint,
        };
        let continuation = ContinuationRequest {
            task_id: request.task_id.clone(),
            resume_hint: stage,
            delay: self.governor.backoff_delay(1),
            reason: SuspendReason::RetryBackoff,
        };

        let message = match self.scheduler.schedule(&continuation).await {
            Ok(_) => {
                warn!(
                    task_id = %request.task_id,
                    stage = stage.map(Stage::number),
                    error = %failure,
                    "Invocation interrupted by storage failure, retrying later"
                );
                format!("interrupted by storage failure, retrying: {failure}")
            }
            Err(e) => {
                error!(
                    task_id = %request.task_id,
                    error = %failure,
                    schedule_error = %e,
                    "Invocation interrupted and no retry could be scheduled"
                );
                format!("interrupted by storage failure, re-invoke to continue: {failure}")
            }
        };
        InvocationResponse::interrupted(stage, message)
    }

    pub async fn run(
        &self,
        request: &InvocationRequest,
        budget: &InvocationBudget,
    ) -> Result<InvocationResponse, CoordinatorError> {
        let task_id = request.task_id.as_str();

        let Some(order) = self.orders.get(task_id).await? else {
            warn!(task_id = %task_id, "Invocation for unknown order");
            return Ok(InvocationResponse::error(format!("order {task_id} not found")));
        };

        let order = match order.status {
            OrderStatus::Completed | OrderStatus::Error => {
                debug!(task_id = %task_id, status = %order.status, "Order already terminal");
                self.discard_checkpoint(task_id).await;
                return Ok(InvocationResponse::for_terminal(&order));
            }
            OrderStatus::Pending => {
                warn!(task_id = %task_id, "Invocation for unpaid order");
                return Ok(InvocationResponse::error(format!("order {task_id} is not paid")));
            }
            OrderStatus::Paid => match self.start_generation(&order).await? {
                Ok(order) => order,
                Err(terminal) => return Ok(terminal),
            },
            OrderStatus::Generating => order,
        };

        let mut checkpoint = self.load_checkpoint(request).await?;

        if let AttemptVerdict::Exhausted { attempts, ceiling } =
            self.governor.record_attempt(&mut checkpoint)
        {
            let message = format!(
                "gave up after {attempts} invocations (limit {ceiling}) at stage {}",
                checkpoint.current_stage
            );
            return self.fail_task(&order, message).await;
        }
        self.persist(&mut checkpoint).await?;

        let ctx = StageContext::new(task_id, order.user_id.clone());
        let mut regressions = 0usize;

        loop {
            let stage = checkpoint.current_stage;
            let estimate = self.config.estimates.for_stage(stage);

            if !budget.can_start(&*self.clock, estimate) {
                info!(
                    task_id = %task_id,
                    stage = stage.number(),
                    remaining_ms = budget.remaining(&*self.clock).as_millis() as u64,
                    "Not enough time left to start stage"
                );
                return self
                    .suspend(&mut checkpoint, SuspendReason::TimeBudget, Duration::ZERO)
                    .await;
            }

            let timer = OperationTimer::new(stage.name());
            let result = self
                .executor
                .run(stage, &ctx, &checkpoint.stage_data)
                .instrument(create_stage_span(stage.number(), stage.name()))
                .await;
            timer.finish();

            match result {
                Ok(StageOutcome::Advance { outputs, cleared }) => {
                    self.governor.record_success(&mut checkpoint);
                    checkpoint.merge_outputs(outputs);
                    for key in cleared {
                        checkpoint.stage_data.remove(key);
                    }
                    workflow_metrics().record_stage_completed();
                    info!(task_id = %task_id, stage = stage.number(), "Stage completed");

                    if !self.advance(&mut checkpoint).await? {
                        return self.complete(&order, &checkpoint).await;
                    }
                }
                Ok(StageOutcome::Hold { outputs, delay }) => {
                    self.governor.record_success(&mut checkpoint);
                    checkpoint.merge_outputs(outputs);
                    return self
                        .suspend(&mut checkpoint, SuspendReason::AwaitingExternalJob, delay)
                        .await;
                }
                Err(StageError::MissingPrerequisite { key, owner, .. })
                    if regressions < Stage::ALL.len() =>
                {
                    regressions += 1;
                    workflow_metrics().record_regression();
                    warn!(
                        task_id = %task_id,
                        stage = stage.number(),
                        missing = key,
                        regress_to = owner.number(),
                        "Missing stage data, regressing"
                    );
                    checkpoint.current_stage = owner;
                    checkpoint.error_count = 0;
                    self.persist(&mut checkpoint).await?;
                }
                Err(failure) if failure.is_recoverable()
                    || matches!(failure, StageError::MissingPrerequisite { .. }) =>
                {
                    workflow_metrics().record_stage_failure();
                    match self.governor.record_failure(&mut checkpoint, &failure) {
                        FailureVerdict::RetrySameStage { delay } => {
                            return self
                                .suspend(&mut checkpoint, SuspendReason::RetryBackoff, delay)
                                .await;
                        }
                        FailureVerdict::SkipForward => {
                            workflow_metrics().record_stage_skipped();
                            for key in stage.produces() {
                                checkpoint.stage_data.insert((*key).to_string(), Value::Null);
                            }
                            for key in stage.transient_keys() {
                                checkpoint.stage_data.remove(*key);
                            }
                            if !self.advance(&mut checkpoint).await? {
                                return self.complete(&order, &checkpoint).await;
                            }
                        }
                    }
                }
                Err(failure) => {
                    workflow_metrics().record_stage_failure();
                    return self.fail_task(&order, failure.to_string()).await;
                }
            }
        }
    }

    /// Move `paid → generating`. A sibling invocation may have done it first.
    async fn start_generation(
        &self,
        order: &Order,
    ) -> Result<Result<Order, InvocationResponse>, CoordinatorError> {
        match self
            .transition_order(order, OrderEvent::StartGeneration, OrderUpdate::default())
            .await
        {
            Ok(order) => {
                info!(task_id = %order.order_id, "Report generation started");
                Ok(Ok(order))
            }
            Err(OrderError::StatusConflict { .. }) => {
                let current = self.reload_order(&order.order_id).await?;
                match current.status {
                    OrderStatus::Generating => Ok(Ok(current)),
                    OrderStatus::Completed | OrderStatus::Error => {
                        Ok(Err(InvocationResponse::for_terminal(&current)))
                    }
                    status => Ok(Err(InvocationResponse::error(format!(
                        "order {} changed to {status} while starting",
                        order.order_id
                    )))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_checkpoint(&self, request: &InvocationRequest) -> Result<Checkpoint, CoordinatorError> {
        let task_id = request.task_id.as_str();
        let now = self.clock.now();

        let stored = match self.checkpoints.get(task_id).await {
            Ok(stored) => stored,
            Err(e @ (CheckpointError::Corrupted { .. } | CheckpointError::Serialization(_))) => {
                warn!(
                    task_id = %task_id,
                    error = %e,
                    "Unreadable checkpoint, restarting as if it were lost"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        match (stored, request.resume_hint) {
            (Some(checkpoint), Some(hint)) if hint != checkpoint.current_stage => {
                warn!(
                    task_id = %task_id,
                    hint = hint.number(),
                    stored = checkpoint.current_stage.number(),
                    "Resume hint disagrees with checkpoint, using checkpoint"
                );
                Ok(checkpoint)
            }
            (Some(checkpoint), _) => Ok(checkpoint),
            (None, Some(hint)) if hint > Stage::FIRST => {
                warn!(
                    task_id = %task_id,
                    hint = hint.number(),
                    "Checkpoint missing, restarting at hinted stage"
                );
                Ok(Checkpoint::starting_at(task_id, hint, now))
            }
            (None, _) => {
                info!(task_id = %task_id, "Starting new checkpoint");
                Ok(Checkpoint::new(task_id, now))
            }
        }
    }

    /// Step to the next stage and persist. Returns `false` once every stage ran.
    async fn advance(&self, checkpoint: &mut Checkpoint) -> Result<bool, CoordinatorError> {
        match checkpoint.current_stage.next() {
            Some(next) => {
                checkpoint.current_stage = next;
                self.persist(checkpoint).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn persist(&self, checkpoint: &mut Checkpoint) -> Result<(), CoordinatorError> {
        checkpoint.updated_at = self.clock.now();
        self.checkpoints.put(&checkpoint.task_id, checkpoint).await?;
        Ok(())
    }

    async fn suspend(
        &self,
        checkpoint: &mut Checkpoint,
        reason: SuspendReason,
        delay: Duration,
    ) -> Result<InvocationResponse, CoordinatorError> {
        self.persist(checkpoint).await?;
        workflow_metrics().record_suspension();

        let stage = checkpoint.current_stage;
        let request = ContinuationRequest {
            task_id: checkpoint.task_id.clone(),
            resume_hint: Some(stage),
            delay,
            reason,
        };

        let message = match self.scheduler.schedule(&request).await {
            Ok(receipt) => {
                debug!(
                    task_id = %checkpoint.task_id,
                    channel = ?receipt.channel,
                    "Continuation scheduled"
                );
                format!("suspended before stage {stage}: {reason:?}")
            }
            Err(e) => {
                warn!(
                    task_id = %checkpoint.task_id,
                    error = %e,
                    "Could not schedule continuation, caller must re-invoke"
                );
                format!("suspended before stage {stage}: {reason:?}, re-invoke to continue")
            }
        };

        Ok(InvocationResponse::suspended(stage, reason, message))
    }

    async fn complete(
        &self,
        order: &Order,
        checkpoint: &Checkpoint,
    ) -> Result<InvocationResponse, CoordinatorError> {
        let Some(artifact_ref) = checkpoint
            .stage_data
            .get(ARTIFACT_REF)
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return self
                .fail_task(order, "no report artifact was produced".to_string())
                .await;
        };

        let update = OrderUpdate::default().with_report_ref(artifact_ref.clone());
        match self.transition_order(order, OrderEvent::Complete, update).await {
            Ok(completed) => {
                workflow_metrics().record_completion();
                info!(
                    task_id = %order.order_id,
                    report_ref = %artifact_ref,
                    attempts = checkpoint.attempts,
                    "Report completed"
                );
                self.notify(&completed, &artifact_ref).await;
                // a leftover checkpoint is removed by the next invocation
                self.discard_checkpoint(&order.order_id).await;
                Ok(InvocationResponse::completed(
                    Some(artifact_ref),
                    "report delivered",
                ))
            }
            Err(OrderError::StatusConflict { .. }) => {
                // Another invocation finished the order first.
                let current = self.reload_order(&order.order_id).await?;
                self.discard_checkpoint(&order.order_id).await;
                debug!(
                    task_id = %order.order_id,
                    status = %current.status,
                    "Lost completion race"
                );
                Ok(InvocationResponse::for_terminal(&current))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_task(
        &self,
        order: &Order,
        message: String,
    ) -> Result<InvocationResponse, CoordinatorError> {
        error!(task_id = %order.order_id, error = %message, "Report task failed");

        let update = OrderUpdate::default().with_error_message(message.clone());
        let response = match self.transition_order(order, OrderEvent::Fail, update).await {
            Ok(_) => {
                workflow_metrics().record_failure();
                InvocationResponse::error(message)
            }
            Err(OrderError::StatusConflict { .. }) => {
                InvocationResponse::for_terminal(&self.reload_order(&order.order_id).await?)
            }
            Err(e) => return Err(e.into()),
        };

        self.discard_checkpoint(&order.order_id).await;
        Ok(response)
    }

    /// Delete the checkpoint of a task whose order is already terminal.
    async fn discard_checkpoint(&self, task_id: &str) {
        if let Err(e) = self.checkpoints.delete(task_id).await {
            warn!(task_id = %task_id, error = %e, "Could not delete checkpoint");
        }
    }

    /// Validate `event` with the lifecycle machine, then write it guarded by
    /// the status the event was validated against.
    async fn transition_order(
        &self,
        order: &Order,
        event: OrderEvent,
        update: OrderUpdate,
    ) -> Result<Order, OrderError> {
        let to = OrderStateMachine::next_status(&order.order_id, order.status, event)?;
        let update = OrderUpdate {
            expected_status: Some(order.status),
            status: Some(to),
            ..update
        };
        self.orders.update(&order.order_id, update).await
    }

    async fn reload_order(&self, order_id: &str) -> Result<Order, CoordinatorError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()).into())
    }

    async fn notify(&self, order: &Order, report_ref: &str) {
        let payload = NotificationPayload {
            order_id: order.order_id.clone(),
            report_ref: report_ref.to_string(),
            message: "Your report is ready".to_string(),
        };

        if let Err(e) = self
            .collaborators
            .messaging
            .deliver_notification(&order.user_id, &payload)
            .await
        {
            workflow_metrics().record_notification_failure();
            warn!(
                task_id = %order.order_id,
                user_id = %order.user_id,
                error = %e,
                "Report notification failed"
            );
        }
    }
}

impl std::fmt::Debug for WorkflowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
