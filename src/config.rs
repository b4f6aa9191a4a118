use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::inference::PollerConfig;
use crate::retry::RetryConfig;
use crate::stages::StageEstimates;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure for report-relay
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub workflow: WorkflowConfig,
    pub continuation: ContinuationConfig,
    pub storage: StorageConfig,
}

/// Upper bound for any configured retry or poll delay.
pub const MAX_CONTINUATION_DELAY_SECS: u64 = 24 * 60 * 60;

/// Options that parameterize the coordinator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Wall-clock budget of one invocation, a little under the host's hard limit
    pub invocation_budget_secs: u64,
    pub estimates: StageEstimates,
    pub retry: RetryConfig,
    pub inference: PollerConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            invocation_budget_secs: 55,
            estimates: StageEstimates::default(),
            retry: RetryConfig::default(),
            inference: PollerConfig::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn invocation_budget(&self) -> Duration {
        Duration::from_secs(self.invocation_budget_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let longest = self.estimates.max();
        if self.invocation_budget() <= longest {
            return Err(ConfigError::Invalid(format!(
                "invocation budget of {}s cannot start a stage estimated at {}s",
                self.invocation_budget_secs,
                longest.as_secs()
            )));
        }
        if self.retry.max_stage_errors == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_stage_errors must be at least 1".to_string(),
            ));
        }
        if self.retry.max_task_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_task_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_ms > MAX_CONTINUATION_DELAY_SECS * 1000 {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms must not exceed {}",
                MAX_CONTINUATION_DELAY_SECS * 1000
            )));
        }
        let schedule = &self.inference.schedule;
        let longest_poll = schedule
            .fast_delay_secs
            .max(schedule.medium_delay_secs)
            .max(schedule.slow_delay_secs);
        if longest_poll > MAX_CONTINUATION_DELAY_SECS {
            return Err(ConfigError::Invalid(format!(
                "inference poll delays must not exceed {MAX_CONTINUATION_DELAY_SECS}s"
            )));
        }
        if self.inference.staleness_ceiling_secs == 0 {
            return Err(ConfigError::Invalid(
                "inference.staleness_ceiling_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationStrategy {
    InProcessQueue,
    ExternalDispatch,
    CallerPolls,
    /// External dispatch for in-flight jobs, in-process queue otherwise
    #[default]
    Layered,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContinuationConfig {
    pub strategy: ContinuationStrategy,
    pub dispatch_timeout_ms: u64,
    /// How often the continuation worker checks the queue
    pub worker_poll_interval_ms: u64,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            strategy: ContinuationStrategy::default(),
            dispatch_timeout_ms: 3_000,
            worker_poll_interval_ms: 1_000,
        }
    }
}

impl ContinuationConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    /// Reject checkpoints whose integrity hash does not match
    pub verify_integrity: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".report-relay"),
            verify_integrity: true,
        }
    }
}

impl StorageConfig {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn orders_dir(&self) -> PathBuf {
        self.state_dir.join("orders")
    }
}

impl RelayConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `report-relay.toml` in the working directory
    /// 3. Environment variables (`REPORT_RELAY_WORKFLOW__INVOCATION_BUDGET_SECS=40`)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("report-relay.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&RelayConfig::default())?);

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("REPORT_RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let relay_config: RelayConfig = builder.build()?.try_deserialize()?;
        relay_config.validate()?;
        Ok(relay_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workflow.validate()
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<RelayConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = RelayConfig::load_env_file();
        RelayConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static RelayConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let config = config()?;
    tracing::info!(
        budget_secs = config.workflow.invocation_budget_secs,
        strategy = ?config.continuation.strategy,
        state_dir = %config.storage.state_dir.display(),
        "Configuration loaded successfully"
    );
    Ok(())
}
