//! The five report stages and the data they exchange.
//!
//! Stages are numbered 1 through 5 and run strictly in order. Each stage
//! reads its prerequisites out of the checkpoint's `stage_data` map and
//! returns the keys it produced; the coordinator merges them back.

pub mod executor;

pub use executor::{StageContext, StageExecutor, StageOutcome};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::collaborators::CollaboratorError;

/// Accumulated stage outputs, persisted inside the checkpoint.
pub type StageData = Map<String, Value>;

pub const INPUT_DATA: &str = "input_data";
pub const USER_IDENTITY: &str = "user_identity";
pub const BASELINE: &str = "baseline";
pub const INSIGHT: &str = "insight";
pub const INFERENCE_JOB: &str = "inference_job";
pub const DOCUMENT_REF: &str = "document_ref";
pub const ARTIFACT_REF: &str = "artifact_ref";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    LoadData,
    BaselineAnalysis,
    AiInference,
    RenderDocument,
    PersistNotify,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::LoadData,
        Stage::BaselineAnalysis,
        Stage::AiInference,
        Stage::RenderDocument,
        Stage::PersistNotify,
    ];

    pub const FIRST: Stage = Stage::LoadData;
    pub const LAST: Stage = Stage::PersistNotify;

    pub fn number(self) -> u8 {
        match self {
            Stage::LoadData => 1,
            Stage::BaselineAnalysis => 2,
            Stage::AiInference => 3,
            Stage::RenderDocument => 4,
            Stage::PersistNotify => 5,
        }
    }

    pub fn from_number(number: u8) -> Option<Stage> {
        Stage::ALL.get(usize::from(number).checked_sub(1)?).copied()
    }

    /// The stage after this one, or `None` once the pipeline is finished.
    pub fn next(self) -> Option<Stage> {
        Stage::from_number(self.number() + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::LoadData => "load_data",
            Stage::BaselineAnalysis => "baseline_analysis",
            Stage::AiInference => "ai_inference",
            Stage::RenderDocument => "render_document",
            Stage::PersistNotify => "persist_notify",
        }
    }

    /// Keys this stage writes into stage data on success.
    pub fn produces(self) -> &'static [&'static str] {
        match self {
            Stage::LoadData => &[INPUT_DATA, USER_IDENTITY],
            Stage::BaselineAnalysis => &[BASELINE],
            Stage::AiInference => &[INSIGHT],
            Stage::RenderDocument => &[DOCUMENT_REF],
            Stage::PersistNotify => &[ARTIFACT_REF],
        }
    }

    /// Keys that must be present in stage data before this stage may run.
    pub fn requires(self) -> &'static [&'static str] {
        match self {
            Stage::LoadData => &[],
            Stage::BaselineAnalysis => &[INPUT_DATA],
            Stage::AiInference => &[INPUT_DATA, BASELINE],
            Stage::RenderDocument => &[INPUT_DATA, BASELINE, INSIGHT],
            Stage::PersistNotify => &[DOCUMENT_REF],
        }
    }

    /// Working keys that only live while this stage is unfinished.
    pub fn transient_keys(self) -> &'static [&'static str] {
        match self {
            Stage::AiInference => &[INFERENCE_JOB],
            _ => &[],
        }
    }

    /// Stage responsible for producing `key`.
    pub fn owner_of(key: &str) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.produces().contains(&key))
    }

    /// Rough completion percentage reported before this stage runs.
    pub fn progress_percent(self) -> u8 {
        (self.number() - 1) * 20
    }

    /// Earliest stage owning a missing prerequisite, if any prerequisite is absent.
    ///
    /// The result is always strictly earlier than `self`.
    pub fn regression_target(self, data: &StageData) -> Option<(Stage, &'static str)> {
        self.requires()
            .iter()
            .filter(|key| !data.contains_key(**key))
            .filter_map(|key| Stage::owner_of(key).map(|owner| (owner, *key)))
            .filter(|(owner, _)| *owner < self)
            .min_by_key(|(owner, _)| *owner)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.number()
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Stage::from_number(number).ok_or_else(|| format!("stage number out of range: {number}"))
    }
}

/// Errors a stage can raise while running.
#[derive(Debug, Error)]
pub enum StageError {
    /// Retryable collaborator failure; counted by the retry governor.
    #[error("transient failure in stage {stage}: {reason}")]
    Transient { stage: Stage, reason: String },

    /// Stage data lost or never populated; repaired by regressing.
    #[error("stage {stage} is missing '{key}', produced by stage {owner}")]
    MissingPrerequisite {
        stage: Stage,
        key: &'static str,
        owner: Stage,
    },

    /// The inference job failed, expired or went stale.
    #[error("external inference job failed: {reason}")]
    ExternalJobFailure { reason: String },

    /// Nothing can recover the task from this.
    #[error("fatal failure in stage {stage}: {reason}")]
    Fatal { stage: Stage, reason: String },
}

impl StageError {
    pub fn from_collaborator(stage: Stage, error: CollaboratorError) -> Self {
        if error.is_transient() {
            StageError::Transient {
                stage,
                reason: error.to_string(),
            }
        } else {
            StageError::Fatal {
                stage,
                reason: error.to_string(),
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, StageError::Transient { .. })
    }
}

/// Fixed per-stage time estimates used to decide whether a stage may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEstimates {
    pub load_data_secs: u64,
    pub baseline_analysis_secs: u64,
    pub ai_inference_secs: u64,
    pub render_document_secs: u64,
    pub persist_notify_secs: u64,
}

impl Default for StageEstimates {
    fn default() -> Self {
        Self {
            load_data_secs: 5,
            baseline_analysis_secs: 15,
            ai_inference_secs: 35,
            render_document_secs: 10,
            persist_notify_secs: 5,
        }
    }
}

impl StageEstimates {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::LoadData => self.load_data_secs,
            Stage::BaselineAnalysis => self.baseline_analysis_secs,
            Stage::AiInference => self.ai_inference_secs,
            Stage::RenderDocument => self.render_document_secs,
            Stage::PersistNotify => self.persist_notify_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn max(&self) -> Duration {
        Stage::ALL
            .into_iter()
            .map(|stage| self.for_stage(stage))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
