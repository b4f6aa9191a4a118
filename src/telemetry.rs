use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Install the JSON structured-logging subscriber on stderr.
///
/// Filtering follows `RUST_LOG`, with `info` as the floor.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init()?;

    tracing::info!("report-relay telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the logs of one invocation
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping a single coordinator invocation
pub fn create_invocation_span(
    task_id: &str,
    resume_hint: Option<u8>,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "invocation",
        task.id = task_id,
        resume.hint = resume_hint,
        correlation.id = correlation_id,
    )
}

/// Span wrapping one stage run inside an invocation
pub fn create_stage_span(stage: u8, stage_name: &str) -> tracing::Span {
    tracing::info_span!("stage", stage.number = stage, stage.name = stage_name)
}

pub fn shutdown_telemetry() {
    tracing::info!("report-relay telemetry shutdown complete");
}
