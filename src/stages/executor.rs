use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    Stage, StageData, StageError, ARTIFACT_REF, BASELINE, DOCUMENT_REF, INPUT_DATA, INSIGHT,
    USER_IDENTITY,
};
use crate::collaborators::{Collaborators, ReportModel};
use crate::inference::AsyncJobPoller;

pub const DOCUMENT_CONTENT_TYPE: &str = "application/pdf";

/// Identity of the task a stage runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub task_id: String,
    pub user_id: String,
}

impl StageContext {
    pub fn new(task_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Successful result of running a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage finished. Merge `outputs`, drop `cleared`, move to the next stage.
    Advance {
        outputs: StageData,
        cleared: Vec<&'static str>,
    },
    /// The stage needs to run again after `delay`. Merge `outputs` and suspend.
    Hold { outputs: StageData, delay: Duration },
}

impl StageOutcome {
    pub fn advance(outputs: StageData) -> Self {
        StageOutcome::Advance {
            outputs,
            cleared: Vec::new(),
        }
    }

    pub fn hold(outputs: StageData, delay: Duration) -> Self {
        StageOutcome::Hold { outputs, delay }
    }

    pub fn clearing(mut self, key: &'static str) -> Self {
        if let StageOutcome::Advance { cleared, .. } = &mut self {
            cleared.push(key);
        }
        self
    }
}

/// Runs one stage at a time against the checkpoint's stage data.
#[derive(Debug)]
pub struct StageExecutor {
    collaborators: Collaborators,
    poller: AsyncJobPoller,
}

impl StageExecutor {
    pub fn new(collaborators: Collaborators, poller: AsyncJobPoller) -> Self {
        Self {
            collaborators,
            poller,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub async fn run(
        &self,
        stage: Stage,
        ctx: &StageContext,
        data: &StageData,
    ) -> Result<StageOutcome, StageError> {
        if let Some((owner, key)) = stage.regression_target(data) {
            return Err(StageError::MissingPrerequisite { stage, key, owner });
        }

        debug!(task_id = %ctx.task_id, stage = stage.number(), "Running stage");

        match stage {
            Stage::LoadData => self.load_data(ctx).await,
            Stage::BaselineAnalysis => self.baseline_analysis(data).await,
            Stage::AiInference => self.poller.run(ctx, data).await,
            Stage::RenderDocument => self.render_document(ctx, data).await,
            Stage::PersistNotify => self.persist_artifact(ctx, data).await,
        }
    }

    async fn load_data(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let input = self
            .collaborators
            .content
            .load_input_data(&ctx.user_id)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::LoadData, e))?;

        // The report can be produced without the messaging profile.
        let identity = match self
            .collaborators
            .messaging
            .get_user_identity(&ctx.user_id)
            .await
        {
            Ok(identity) => serde_json::to_value(identity).unwrap_or(Value::Null),
            Err(e) => {
                warn!(
                    task_id = %ctx.task_id,
                    user_id = %ctx.user_id,
                    error = %e,
                    "User identity unavailable"
                );
                Value::Null
            }
        };

        let mut outputs = StageData::new();
        outputs.insert(INPUT_DATA.to_string(), input);
        outputs.insert(USER_IDENTITY.to_string(), identity);
        Ok(StageOutcome::advance(outputs))
    }

    async fn baseline_analysis(&self, data: &StageData) -> Result<StageOutcome, StageError> {
        let input = data.get(INPUT_DATA).cloned().unwrap_or(Value::Null);
        let baseline = self
            .collaborators
            .content
            .compute_baseline_analysis(&input)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::BaselineAnalysis, e))?;

        let mut outputs = StageData::new();
        outputs.insert(BASELINE.to_string(), baseline);
        Ok(StageOutcome::advance(outputs))
    }

    async fn render_document(
        &self,
        ctx: &StageContext,
        data: &StageData,
    ) -> Result<StageOutcome, StageError> {
        let model = ReportModel {
            order_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            input_data: data.get(INPUT_DATA).cloned().unwrap_or(Value::Null),
            baseline: data.get(BASELINE).cloned().unwrap_or(Value::Null),
            insight: data.get(INSIGHT).filter(|v| !v.is_null()).cloned(),
        };

        let bytes = self
            .collaborators
            .content
            .render_document(&model)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::RenderDocument, e))?;
        let size = bytes.len();

        let document_ref = self
            .collaborators
            .blobs
            .put(bytes, DOCUMENT_CONTENT_TYPE)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::RenderDocument, e))?;

        debug!(
            task_id = %ctx.task_id,
            document_ref = %document_ref,
            bytes = size,
            "Document stored"
        );

        let mut outputs = StageData::new();
        outputs.insert(DOCUMENT_REF.to_string(), Value::String(document_ref));
        Ok(StageOutcome::advance(outputs))
    }

    async fn persist_artifact(
        &self,
        ctx: &StageContext,
        data: &StageData,
    ) -> Result<StageOutcome, StageError> {
        let Some(document_ref) = data.get(DOCUMENT_REF).and_then(Value::as_str) else {
            return Err(StageError::Fatal {
                stage: Stage::PersistNotify,
                reason: "no rendered document to deliver".to_string(),
            });
        };

        let stored = self
            .collaborators
            .blobs
            .get(document_ref)
            .await
            .map_err(|e| StageError::from_collaborator(Stage::PersistNotify, e))?;

        if stored.is_none() {
            warn!(
                task_id = %ctx.task_id,
                document_ref = %document_ref,
                "Rendered document vanished from blob store"
            );
            return Err(StageError::MissingPrerequisite {
                stage: Stage::PersistNotify,
                key: DOCUMENT_REF,
                owner: Stage::RenderDocument,
            });
        }

        let mut outputs = StageData::new();
        outputs.insert(ARTIFACT_REF.to_string(), Value::String(document_ref.to_string()));
        Ok(StageOutcome::advance(outputs))
    }
}
