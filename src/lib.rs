// report-relay - resumable report generation across time-boxed invocations
// This exposes the core components for testing and integration

pub mod checkpoint;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod continuation;
pub mod coordinator;
pub mod inference;
pub mod mocks;
pub mod observability;
pub mod orders;
pub mod retry;
pub mod stages;
pub mod telemetry;

// Re-export key types for easy access
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileSystemCheckpointStore, InMemoryCheckpointStore};
pub use clock::{Clock, InvocationBudget, ManualClock, SystemClock};
pub use collaborators::{CollaboratorError, Collaborators};
pub use config::{config, init_config, ContinuationStrategy, RelayConfig, WorkflowConfig};
pub use continuation::{
    CallerPolls, ContinuationRequest, ContinuationScheduler, ContinuationWorker, DelayedTaskQueue,
    ExternalDispatch, LayeredScheduler, SchedulerError, SuspendReason,
};
pub use coordinator::{CoordinatorError, InvocationRequest, InvocationResponse, InvocationStatus, WorkflowCoordinator};
pub use inference::{AsyncJobPoller, InferenceJobHandle, PollSchedule, StalenessPolicy};
pub use observability::{workflow_metrics, OperationTimer, WorkflowMetrics};
pub use orders::{Order, OrderError, OrderEvent, OrderStateMachine, OrderStatus, OrderStore, OrderUpdate};
pub use retry::{RetryConfig, RetryGovernor};
pub use stages::{Stage, StageData, StageError, StageEstimates};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
