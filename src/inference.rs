//! AI inference stage backed by an asynchronous batch job.
//!
//! The first run of the stage submits a job and stores its handle in stage
//! data, then holds. Every later run polls the job once: a finished job
//! yields the insight, a pending one holds again with a delay that grows
//! with the time already waited, and a job pending past the staleness
//! ceiling either fails the task or lets it continue without an insight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::collaborators::{ExternalJobStatus, InferenceRequest, InferenceService};
use crate::stages::{
    Stage, StageContext, StageData, StageError, StageOutcome, BASELINE, INFERENCE_JOB,
    INPUT_DATA, INSIGHT,
};

/// Persisted under the `inference_job` key while a job is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceJobHandle {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    pub external_status: ExternalJobStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Abandon the task.
    #[default]
    Fail,
    /// Render the report with a `null` insight.
    ContinueWithoutInsight,
}

/// Delay before the next poll, chosen by how long the job has been waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSchedule {
    pub fast_window_secs: u64,
    pub fast_delay_secs: u64,
    pub medium_window_secs: u64,
    pub medium_delay_secs: u64,
    pub slow_delay_secs: u64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            fast_window_secs: 60,
            fast_delay_secs: 10,
            medium_window_secs: 300,
            medium_delay_secs: 30,
            slow_delay_secs: 60,
        }
    }
}

impl PollSchedule {
    pub fn delay_for(&self, waited: Duration) -> Duration {
        let waited = waited.as_secs();
        let secs = if waited < self.fast_window_secs {
            self.fast_delay_secs
        } else if waited < self.medium_window_secs {
            self.medium_delay_secs
        } else {
            self.slow_delay_secs
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    pub schedule: PollSchedule,
    pub staleness_ceiling_secs: u64,
    pub staleness_policy: StalenessPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            schedule: PollSchedule::default(),
            staleness_ceiling_secs: 20 * 60,
            staleness_policy: StalenessPolicy::Fail,
        }
    }
}

pub struct AsyncJobPoller {
    inference: Arc<dyn InferenceService>,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
}

impl AsyncJobPoller {
    pub fn new(
        inference: Arc<dyn InferenceService>,
        clock: Arc<dyn Clock>,
        config: PollerConfig,
    ) -> Self {
        Self {
            inference,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run the inference stage once against the accumulated stage data.
    pub async fn run(
        &self,
        ctx: &StageContext,
        data: &StageData,
    ) -> Result<StageOutcome, StageError> {
        match Self::existing_handle(ctx, data) {
            Some(handle) => self.poll(ctx, handle).await,
            None => self.submit(ctx, data).await,
        }
    }

    fn existing_handle(ctx: &StageContext, data: &StageData) -> Option<InferenceJobHandle> {
        let raw = data.get(INFERENCE_JOB).filter(|value| !value.is_null())?;
        match serde_json::from_value(raw.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(
                    task_id = %ctx.task_id,
                    error = %e,
                    "Unreadable inference job handle, submitting a new job"
                );
                None
            }
        }
    }

    async fn submit(
        &self,
        ctx: &StageContext,
        data: &StageData,
    ) -> Result<StageOutcome, StageError> {
        let request = InferenceRequest {
            order_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            input_data: data.get(INPUT_DATA).cloned().unwrap_or(Value::Null),
            baseline: data.get(BASELINE).cloned().unwrap_or(Value::Null),
        };

        let job_id = self
            .inference
            .submit_batch_job(&request)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::AiInference, e))?;

        let handle = InferenceJobHandle {
            job_id,
            submitted_at: self.clock.now(),
            external_status: ExternalJobStatus::Pending,
        };
        info!(
            task_id = %ctx.task_id,
            job_id = %handle.job_id,
            "Inference job submitted"
        );

        let delay = self.config.schedule.delay_for(Duration::ZERO);
        Ok(StageOutcome::hold(Self::handle_output(&handle)?, delay))
    }

    async fn poll(
        &self,
        ctx: &StageContext,
        mut handle: InferenceJobHandle,
    ) -> Result<StageOutcome, StageError> {
        let report = self
            .inference
            .get_job_status(&handle.job_id)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::AiInference, e))?;
        handle.external_status = report.status;

        match report.status {
            ExternalJobStatus::Completed => {
                let insight = match report.result_ref {
                    Some(result_ref) => self.fetch_insight(ctx, &result_ref).await?,
                    None => {
                        warn!(
                            task_id = %ctx.task_id,
                            job_id = %handle.job_id,
                            "Completed job has no result reference"
                        );
                        Value::Null
                    }
                };
                info!(
                    task_id = %ctx.task_id,
                    job_id = %handle.job_id,
                    has_insight = !insight.is_null(),
                    "Inference job completed"
                );
                Ok(Self::with_insight(insight))
            }
            ExternalJobStatus::Failed => Err(StageError::ExternalJobFailure {
                reason: format!("job {} failed", handle.job_id),
            }),
            ExternalJobStatus::Expired => Err(StageError::ExternalJobFailure {
                reason: format!("job {} expired", handle.job_id),
            }),
            ExternalJobStatus::Pending => {
                let waited = (self.clock.now() - handle.submitted_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                if waited > Duration::from_secs(self.config.staleness_ceiling_secs) {
                    return self.on_stale(ctx, &handle, waited);
                }

                let delay = self.config.schedule.delay_for(waited);
                debug!(
                    task_id = %ctx.task_id,
                    job_id = %handle.job_id,
                    waited_secs = waited.as_secs(),
                    delay_secs = delay.as_secs(),
                    "Inference job still pending"
                );
                Ok(StageOutcome::hold(Self::handle_output(&handle)?, delay))
            }
        }
    }

    fn on_stale(
        &self,
        ctx: &StageContext,
        handle: &InferenceJobHandle,
        waited: Duration,
    ) -> Result<StageOutcome, StageError> {
        match self.config.staleness_policy {
            StalenessPolicy::Fail => Err(StageError::ExternalJobFailure {
                reason: format!(
                    "job {} still pending after {}s",
                    handle.job_id,
                    waited.as_secs()
                ),
            }),
            StalenessPolicy::ContinueWithoutInsight => {
                warn!(
                    task_id = %ctx.task_id,
                    job_id = %handle.job_id,
                    waited_secs = waited.as_secs(),
                    "Inference job went stale, continuing without insight"
                );
                Ok(Self::with_insight(Value::Null))
            }
        }
    }

    async fn fetch_insight(&self, ctx: &StageContext, result_ref: &str) -> Result<Value, StageError> {
        let raw = self
            .inference
            .fetch_result(result_ref)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::AiInference, e))?;

        match serde_json::from_str::<Value>(&raw) {
            Ok(insight) => Ok(insight),
            Err(e) => {
                warn!(
                    task_id = %ctx.task_id,
                    result_ref = %result_ref,
                    error = %e,
                    "Inference result is not valid JSON, using empty insight"
                );
                Ok(Value::Null)
            }
        }
    }

    fn with_insight(insight: Value) -> StageOutcome {
        let mut outputs = StageData::new();
        outputs.insert(INSIGHT.to_string(), insight);
        StageOutcome::advance(outputs).clearing(INFERENCE_JOB)
    }

    fn handle_output(handle: &InferenceJobHandle) -> Result<StageData, StageError> {
        let value = serde_json::to_value(handle).map_err(|e| StageError::Fatal {
            stage: Stage::AiInference,
            reason: format!("cannot encode job handle: {e}"),
        })?;
        let mut outputs = StageData::new();
        outputs.insert(INFERENCE_JOB.to_string(), value);
        Ok(outputs)
    }
}

impl std::fmt::Debug for AsyncJobPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJobPoller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
