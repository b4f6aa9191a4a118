use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeSet;

use report_relay::checkpoint::{CheckpointStore, FileSystemCheckpointStore};
use report_relay::config::{config, init_config, RelayConfig};
use report_relay::mocks::SimulationHarness;
use report_relay::observability::workflow_metrics;
use report_relay::orders::{FileSystemOrderStore, OrderStore};
use report_relay::telemetry::{init_telemetry, shutdown_telemetry};

#[derive(Parser)]
#[command(name = "report-relay")]
#[command(about = "Resumable multi-stage report generation for time-boxed hosts")]
#[command(long_about = "report-relay splits a five-stage report pipeline across many short \
                       invocations, persisting progress in checkpoints and scheduling \
                       continuations until every order is completed or failed.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show stored orders and checkpoints
    Status {
        /// Only show this task
        #[arg(long, help = "Task (order) id to inspect")]
        task_id: Option<String>,
    },
    /// Run one order end to end against scripted in-memory collaborators
    Simulate {
        /// Number of polls that report the inference job as still pending
        #[arg(long, default_value = "3")]
        inference_polls: usize,
        /// Override the invocation budget in seconds
        #[arg(long)]
        budget_secs: Option<u64>,
        /// Stop after this many invocations
        #[arg(long, default_value = "50")]
        max_invocations: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry()?;
    init_config()?;

    let result = match cli.command {
        Commands::Status { task_id } => tokio::runtime::Runtime::new()?
            .block_on(async { status_command(config()?, task_id.as_deref()).await }),
        Commands::Simulate {
            inference_polls,
            budget_secs,
            max_invocations,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            simulate_command(config()?, inference_polls, budget_secs, max_invocations).await
        }),
    };

    shutdown_telemetry();
    result
}

async fn status_command(config: &RelayConfig, task_id: Option<&str>) -> Result<()> {
    let orders = FileSystemOrderStore::new(config.storage.orders_dir());
    let checkpoints = FileSystemCheckpointStore::new(config.storage.checkpoint_dir())
        .with_integrity_checks(config.storage.verify_integrity);

    let task_ids = match task_id {
        Some(id) => vec![id.to_string()],
        None => {
            let mut ids: BTreeSet<String> = orders
                .list()
                .await
                .context("listing orders")?
                .into_iter()
                .collect();
            ids.extend(checkpoints.list().await.context("listing checkpoints")?);
            ids.into_iter().collect()
        }
    };

    if task_ids.is_empty() {
        println!("No tasks found under {}", config.storage.state_dir.display());
        return Ok(());
    }

    for id in task_ids {
        let order = orders.get(&id).await?;
        let checkpoint = checkpoints.get(&id).await?;

        let summary = json!({
            "task_id": id,
            "order_status": order.as_ref().map(|o| o.status),
            "report_ref": order.as_ref().and_then(|o| o.report_ref.clone()),
            "error_message": order.as_ref().and_then(|o| o.error_message.clone()),
            "current_stage": checkpoint.as_ref().map(|c| c.current_stage),
            "attempts": checkpoint.as_ref().map(|c| c.attempts),
            "error_count": checkpoint.as_ref().map(|c| c.error_count),
            "last_error": checkpoint.as_ref().and_then(|c| c.last_error.clone()),
            "updated_at": checkpoint.as_ref().map(|c| c.updated_at),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

async fn simulate_command(
    config: &RelayConfig,
    inference_polls: usize,
    budget_secs: Option<u64>,
    max_invocations: usize,
) -> Result<()> {
    let mut config = config.clone();
    if let Some(budget_secs) = budget_secs {
        config.workflow.invocation_budget_secs = budget_secs;
    }
    config.validate()?;

    let harness = SimulationHarness::new(config);
    harness.collaborators.pending_polls(inference_polls);
    harness.seed_paid_order("sim-order-1", "sim-user-1").await;

    let responses = harness.run_until_idle("sim-order-1", max_invocations).await;
    for response in &responses {
        println!("{}", serde_json::to_string(response)?);
    }

    workflow_metrics().log_stats();
    match responses.last() {
        Some(last) if last.is_terminal() => Ok(()),
        _ => anyhow::bail!("simulation stopped after {} invocations", responses.len()),
    }
}
