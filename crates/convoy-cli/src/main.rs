mod handlers;

use clap::{Args, Parser, Subcommand};
use convoy_core::ConvoyConfig;
use convoy_orchestrator::{NewTask, Orchestrator, TaskStatus};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoy", about = "Convoy: capability-routed task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "convoy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop
    Controller {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
    /// Run an agent that executes the configured handlers
    Agent {
        /// Agent id
        #[arg(long)]
        id: String,
        /// Capability tag (repeatable)
        #[arg(long = "capability", short = 'C')]
        capabilities: Vec<String>,
    },
    /// Manage agents
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Manage tasks
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Inspect results
    Results {
        #[command(subcommand)]
        action: ResultAction,
    },
    /// Maintenance and statistics
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Register an agent
    Register {
        id: String,
        /// Capability tag (repeatable)
        #[arg(long = "capability", short = 'C')]
        capabilities: Vec<String>,
    },
    /// Deregister an agent
    Deregister { id: String },
    /// List active agents
    List {
        /// Only agents with this capability
        #[arg(long)]
        capability: Option<String>,
    },
    /// Active agent counts per capability
    Status,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a task
    Submit(SubmitArgs),
    /// List tasks
    List {
        /// pending, assigned, completed or failed
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Show a full task record
    Status { task_id: String },
    /// Cancel a pending task
    Cancel { task_id: String },
    /// Requeue recently failed tasks
    Retry {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Task type
    #[arg(long = "type")]
    task_type: String,
    /// JSON payload
    #[arg(long, default_value = "{}")]
    payload: String,
    #[arg(long, default_value = convoy_core::ANY_CAPABILITY)]
    capability: String,
    /// 1 (lowest) to 10 (highest)
    #[arg(long, default_value_t = 5)]
    priority: u8,
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Submit a workflow from a JSON array of task definitions
    Submit {
        #[arg(long)]
        name: String,
        /// File holding the definitions
        #[arg(long)]
        file: PathBuf,
    },
    /// Refresh and show a workflow
    Status { workflow_id: String },
    /// List workflows
    List,
}

#[derive(Subcommand)]
enum ResultAction {
    /// Show the result of a completed task
    Show { task_id: String },
    /// Combine several results into one stored record
    Aggregate {
        #[arg(required = true)]
        task_ids: Vec<String>,
    },
    /// Show a stored aggregate
    ShowAggregate { aggregate_id: String },
}

#[derive(Subcommand)]
enum SystemAction {
    /// Remove archived tasks and results older than the retention window
    Cleanup {
        /// Defaults to controller.retention_days
        #[arg(long)]
        retention_days: Option<u64>,
    },
    /// Record counts
    Stats,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Flip the shutdown channel on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = ConvoyConfig::load(&cli.config)?;
    let engine = Orchestrator::open(config).await?;

    match cli.command {
        Commands::Controller { once } => {
            let controller = engine.controller();
            if once {
                print_json(&controller.tick().await?)?;
            } else {
                controller.run(shutdown_on_ctrl_c()).await;
            }
        }
        Commands::Agent { id, capabilities } => {
            let handlers = Arc::new(handlers::build_handlers(&engine.config().handlers));
            if handlers.is_empty() {
                warn!("No [[handlers]] configured; every claimed task will fail");
            }
            let runtime = engine.runtime(&id, &capabilities, handlers);
            runtime.run(shutdown_on_ctrl_c()).await?;
        }
        Commands::Agents { action } => match action {
            AgentAction::Register { id, capabilities } => {
                print_json(&engine.register_agent(&id, &capabilities).await?)?;
            }
            AgentAction::Deregister { id } => {
                engine.deregister_agent(&id).await?;
                print_json(&serde_json::json!({ "deregistered": id }))?;
            }
            AgentAction::List { capability } => {
                print_json(&engine.list_agents(capability.as_deref()).await?)?;
            }
            AgentAction::Status => print_json(&engine.agent_status().await?)?,
        },
        Commands::Tasks { action } => match action {
            TaskAction::Submit(args) => {
                let payload: serde_json::Value = serde_json::from_str(&args.payload)
                    .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {e}"))?;
                let mut task = NewTask::new(args.task_type, payload)
                    .with_capability(args.capability)
                    .with_priority(args.priority);
                if let Some(max_attempts) = args.max_attempts {
                    task = task.with_max_attempts(max_attempts);
                }
                let task_id = engine.submit_task(task).await?;
                print_json(&serde_json::json!({ "task_id": task_id }))?;
            }
            TaskAction::List { status } => print_json(&engine.list_tasks(status).await?)?,
            TaskAction::Status { task_id } => print_json(&engine.task_status(&task_id).await?)?,
            TaskAction::Cancel { task_id } => {
                engine.cancel_task(&task_id).await?;
                print_json(&serde_json::json!({ "cancelled": task_id }))?;
            }
            TaskAction::Retry { max_age_hours } => {
                let requeued = engine.retry_failed(max_age_hours).await?;
                print_json(&serde_json::json!({ "requeued": requeued }))?;
            }
        },
        Commands::Workflows { action } => match action {
            WorkflowAction::Submit { name, file } => {
                let raw = tokio::fs::read_to_string(&file).await.map_err(|e| {
                    anyhow::anyhow!("Failed to read workflow file '{}': {e}", file.display())
                })?;
                let tasks: Vec<NewTask> = serde_json::from_str(&raw)?;
                let workflow_id = engine.submit_workflow(&name, tasks).await?;
                print_json(&serde_json::json!({ "workflow_id": workflow_id }))?;
            }
            WorkflowAction::Status { workflow_id } => {
                print_json(&engine.workflow_status(&workflow_id).await?)?;
            }
            WorkflowAction::List => print_json(&engine.list_workflows().await?)?,
        },
        Commands::Results { action } => match action {
            ResultAction::Show { task_id } => print_json(&engine.show_result(&task_id).await?)?,
            ResultAction::Aggregate { task_ids } => {
                print_json(&engine.aggregate_results(&task_ids).await?)?;
            }
            ResultAction::ShowAggregate { aggregate_id } => {
                print_json(&engine.show_aggregate(&aggregate_id).await?)?;
            }
        },
        Commands::System { action } => match action {
            SystemAction::Cleanup { retention_days } => {
                let days = retention_days.unwrap_or(engine.config().controller.retention_days);
                let removed = engine.cleanup(days).await?;
                print_json(&serde_json::json!({ "removed": removed, "retention_days": days }))?;
            }
            SystemAction::Stats => print_json(&engine.stats().await?)?,
        },
    }

    Ok(())
}
