use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointError, CheckpointMetadata, CheckpointStore};

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// One JSON file per task under a state directory.
///
/// Writes go to a temporary sibling and are renamed into place, so readers
/// only ever observe a complete checkpoint. Concurrent writers race; the
/// last rename wins.
#[derive(Debug, Clone)]
pub struct FileSystemCheckpointStore {
    directory: PathBuf,
    verify_integrity: bool,
}

impl FileSystemCheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            verify_integrity: true,
        }
    }

    pub fn with_integrity_checks(mut self, enabled: bool) -> Self {
        self.verify_integrity = enabled;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn checkpoint_path(&self, task_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_task_id(task_id)?;
        Ok(self.directory.join(format!("{task_id}{CHECKPOINT_SUFFIX}")))
    }

    /// Hash of the fields that must not change behind the coordinator's back.
    fn integrity_hash(checkpoint: &Checkpoint) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        checkpoint.task_id.hash(&mut hasher);
        checkpoint.version.hash(&mut hasher);
        checkpoint.current_stage.hash(&mut hasher);
        checkpoint.attempts.hash(&mut hasher);
        checkpoint.error_count.hash(&mut hasher);
        checkpoint.started_at.timestamp_millis().hash(&mut hasher);
        // serde_json::Map keeps keys sorted, so the rendering is stable
        serde_json::Value::Object(checkpoint.stage_data.clone())
            .to_string()
            .hash(&mut hasher);

        format!("{:x}", hasher.finish())
    }
}

fn validate_task_id(task_id: &str) -> Result<(), CheckpointError> {
    let valid = !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidTaskId(task_id.to_string()))
    }
}

#[async_trait]
impl CheckpointStore for FileSystemCheckpointStore {
    async fn get(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.checkpoint_path(task_id)?;

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(task_id = %task_id, file = ?path, "No checkpoint file found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;

        if self.verify_integrity {
            let actual = Self::integrity_hash(&checkpoint);
            if actual != checkpoint.metadata.integrity_hash {
                warn!(
                    task_id = %task_id,
                    expected_hash = %checkpoint.metadata.integrity_hash,
                    actual_hash = %actual,
                    "Checkpoint integrity check failed"
                );
                return Err(CheckpointError::Corrupted {
                    task_id: task_id.to_string(),
                    reason: "integrity hash mismatch".to_string(),
                });
            }
        }

        Ok(Some(checkpoint))
    }

    async fn put(&self, task_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(task_id)?;
        fs::create_dir_all(&self.directory).await?;

        let mut to_save = checkpoint.clone();
        to_save.metadata = CheckpointMetadata {
            writer_host: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            writer_pid: Some(std::process::id()),
            integrity_hash: Self::integrity_hash(&to_save),
        };

        let serialized = serde_json::to_string_pretty(&to_save)?;

        // unique temp name so overlapping writers never share a partial file
        let temp_path = self
            .directory
            .join(format!(".{task_id}.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            task_id = %task_id,
            stage = checkpoint.current_stage.number(),
            attempts = checkpoint.attempts,
            file = ?path,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(task_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(task_id = %task_id, "Checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut task_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(task_id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(CHECKPOINT_SUFFIX))
            {
                task_ids.push(task_id.to_string());
            }
        }
        task_ids.sort();
        Ok(task_ids)
    }
}
