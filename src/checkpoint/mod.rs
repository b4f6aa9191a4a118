//! Per-task progress records.
//!
//! A checkpoint is the ephemeral working state of one report task: which
//! stage runs next, what earlier stages produced, and the counters the retry
//! governor reads. Stores offer atomic single-key reads and full-overwrite
//! writes only; everything stronger is enforced by the coordinator.

pub mod filesystem;

pub use filesystem::FileSystemCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::stages::{Stage, StageData};

pub const CHECKPOINT_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint for task {task_id} is corrupted: {reason}")]
    Corrupted { task_id: String, reason: String },

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub writer_host: String,
    pub writer_pid: Option<u32>,
    pub integrity_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub task_id: String,
    pub current_stage: Stage,
    pub stage_data: StageData,
    /// Invocations that touched this task. Never reset.
    pub attempts: u32,
    /// Consecutive failures of `current_stage`. Reset on any stage success.
    pub error_count: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    pub fn new(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::starting_at(task_id, Stage::FIRST, now)
    }

    /// Fresh checkpoint positioned at `stage` with no stage data.
    pub fn starting_at(task_id: impl Into<String>, stage: Stage, now: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION.to_string(),
            task_id: task_id.into(),
            current_stage: stage,
            stage_data: StageData::new(),
            attempts: 0,
            error_count: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
            metadata: CheckpointMetadata::default(),
        }
    }

    pub fn merge_outputs(&mut self, outputs: StageData) {
        self.stage_data.extend(outputs);
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Full overwrite of whatever is stored for `task_id`.
    async fn put(&self, task_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Deleting a missing checkpoint is not an error.
    async fn delete(&self, task_id: &str) -> Result<(), CheckpointError>;

    async fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

/// Process-local store, used by tests and simulations.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(task_id).cloned())
    }

    async fn put(&self, task_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()
            .await
            .insert(task_id.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(task_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_put_overwrites() {
        let store = InMemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new("order-1", Utc::now());
        store.put("order-1", &checkpoint).await.unwrap();

        checkpoint.current_stage = Stage::AiInference;
        checkpoint
            .stage_data
            .insert("baseline".to_string(), json!({"score": 7}));
        store.put("order-1", &checkpoint).await.unwrap();

        let loaded = store.get("order-1").await.unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::AiInference);
        assert_eq!(loaded.stage_data["baseline"]["score"], 7);
        assert_eq!(store.list().await.unwrap(), vec!["order-1".to_string()]);
    }

    #[tokio::test]
    async fn test_in_memory_delete_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        store
            .put("order-2", &Checkpoint::new("order-2", Utc::now()))
            .await
            .unwrap();

        store.delete("order-2").await.unwrap();
        store.delete("order-2").await.unwrap();
        assert!(store.get("order-2").await.unwrap().is_none());
    }
}
