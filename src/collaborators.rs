//! External collaborator seams
//!
//! Every system the workflow talks to sits behind an async trait so the
//! coordinator can be wired with real clients in production and with the
//! scripted doubles from [`crate::mocks`] in tests. Collaborators are
//! injected per coordinator; there are no process-wide clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl CollaboratorError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Unavailable(_) | CollaboratorError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
    pub channel_address: Option<String>,
}

/// Everything the renderer needs to produce the final document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportModel {
    pub order_id: String,
    pub user_id: String,
    pub input_data: Value,
    pub baseline: Value,
    /// `None` when inference produced no usable result.
    pub insight: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub order_id: String,
    pub report_ref: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub order_id: String,
    pub user_id: String,
    pub input_data: Value,
    pub baseline: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalJobStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: ExternalJobStatus,
    pub result_ref: Option<String>,
}

/// Opaque reference to a stored blob.
pub type BlobRef = String;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentCollaborators: Send + Sync {
    async fn load_input_data(&self, user_id: &str) -> Result<Value, CollaboratorError>;

    async fn compute_baseline_analysis(&self, input: &Value) -> Result<Value, CollaboratorError>;

    async fn render_document(&self, model: &ReportModel) -> Result<Vec<u8>, CollaboratorError>;
}

/// Messaging platform client. Failures here never fail the workflow.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessagingCollaborator: Send + Sync {
    async fn get_user_identity(&self, user_id: &str) -> Result<UserIdentity, CollaboratorError>;

    async fn deliver_notification(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<(), CollaboratorError>;
}

/// Asynchronous batch inference service.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn submit_batch_job(&self, request: &InferenceRequest) -> Result<String, CollaboratorError>;

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport, CollaboratorError>;

    async fn fetch_result(&self, result_ref: &str) -> Result<String, CollaboratorError>;
}

/// Scheduler that is not bound by the invocation budget.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalScheduler: Send + Sync {
    async fn dispatch_event(&self, event_type: &str, payload: Value) -> Result<(), CollaboratorError>;
}

/// Binary storage for rendered documents.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<BlobRef, CollaboratorError>;

    async fn get(&self, blob_ref: &str) -> Result<Option<Vec<u8>>, CollaboratorError>;
}

/// Collaborators used while running stages.
#[derive(Clone)]
pub struct Collaborators {
    pub content: Arc<dyn ContentCollaborators>,
    pub messaging: Arc<dyn MessagingCollaborator>,
    pub inference: Arc<dyn InferenceService>,
    pub blobs: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
