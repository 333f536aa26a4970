mod status;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::AppConfig;
use stepwise_core::error::StepwiseError;
use stepwise_core::event::EventBus;
use stepwise_core::traits::{CompletionClient, StateStore};
use stepwise_core::types::{RunId, StepStatus};
use stepwise_engine::{load_workflow, period_key, RunLogger, Scheduler, TaskGraph};
use stepwise_notify::build_notifiers;
use stepwise_store::open_store;

const DEFAULT_CONFIG: &str = "stepwise.toml";

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Run dependency-ordered LLM workflows under a consumption budget"
)]
struct Cli {
    /// Path to config file (defaults to ./stepwise.toml if present)
    #[arg(short, long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow until it completes, gets stuck, or exhausts the budget
    Run {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
        /// Run directory holding step state (overrides run.run_dir)
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Units allowed per period, 0 for unlimited (overrides budget.limit_units)
        #[arg(long)]
        budget_limit: Option<u64>,
        /// Accounting period key (overrides the key derived from budget.period)
        #[arg(long)]
        period_key: Option<String>,
        /// Steps allowed in flight at once (overrides run.max_parallel)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow and print its execution order
    Validate {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
    },
    /// Show per-step status and period usage
    Status {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
        #[arg(long)]
        run_dir: Option<PathBuf>,
        #[arg(long)]
        period_key: Option<String>,
    },
    /// Delete step records so the steps run again
    Reset {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Step to reset (repeatable)
        #[arg(long = "step", required_unless_present = "failed", conflicts_with = "failed")]
        steps: Vec<String>,
        /// Reset every FAILED step
        #[arg(long)]
        failed: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepwise=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            let validation = e
                .downcast_ref::<StepwiseError>()
                .is_some_and(StepwiseError::is_validation);
            ExitCode::from(if validation { 2 } else { 1 })
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(0);
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            workflow,
            run_dir,
            budget_limit,
            period_key,
            max_parallel,
            json,
        } => {
            let mut config = config;
            if let Some(limit) = budget_limit {
                config.budget.limit_units = limit;
            }
            if let Some(n) = max_parallel {
                anyhow::ensure!(n >= 1, "--max-parallel must be at least 1");
                config.run.max_parallel = n;
            }
            run_workflow(&config, &workflow, run_dir, period_key, json).await
        }
        Commands::Validate { workflow } => {
            let graph = load_workflow(&workflow)?;
            println!("Workflow OK: {} steps", graph.len());
            for (i, id) in graph.topological_order().iter().enumerate() {
                let step = graph.get(id).map(|s| s.depends_on.join(", ")).unwrap_or_default();
                if step.is_empty() {
                    println!("  {:>3}. {}", i + 1, id);
                } else {
                    println!("  {:>3}. {} (after {})", i + 1, id, step);
                }
            }
            Ok(0)
        }
        Commands::Status {
            workflow,
            run_dir,
            period_key,
        } => {
            let graph = load_workflow(&workflow)?;
            let run_dir = run_dir.unwrap_or_else(|| config.run_dir());
            show_status(&config, &graph, &run_dir, period_key).await?;
            Ok(0)
        }
        Commands::Reset {
            workflow,
            run_dir,
            steps,
            failed,
        } => {
            let graph = load_workflow(&workflow)?;
            let run_dir = run_dir.unwrap_or_else(|| config.run_dir());
            reset_steps(&config, &graph, &run_dir, steps, failed).await?;
            Ok(0)
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(Path::new(DEFAULT_CONFIG))?,
    };
    Ok(config)
}

fn resolve_period(config: &AppConfig, override_key: Option<String>) -> String {
    override_key.unwrap_or_else(|| period_key(config.budget.period, chrono::Local::now()))
}

async fn run_workflow(
    config: &AppConfig,
    workflow: &Path,
    run_dir: Option<PathBuf>,
    period_override: Option<String>,
    json: bool,
) -> anyhow::Result<u8> {
    // Validate before anything touches the run directory
    let graph = load_workflow(workflow)?;
    let run_dir = run_dir.unwrap_or_else(|| config.run_dir());
    let store = open_store(config, &run_dir)?;
    let period = resolve_period(config, period_override);

    let client: Arc<dyn CompletionClient> = Arc::from(stepwise_llm::build_client(config));
    let run_id = RunId::new();
    let notifiers = build_notifiers(config, &run_dir, &run_id);
    info!(
        run_id = %run_id,
        workflow = %workflow.display(),
        run_dir = %run_dir.display(),
        channels = notifiers.len(),
        "Starting run"
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupt received, no new steps will start");
        cancel_clone.cancel();
    });

    let event_bus = Arc::new(EventBus::default());
    let logger_cancel = CancellationToken::new();
    let logger = RunLogger::new(&run_dir, config.run.log_level).spawn(
        &event_bus,
        run_id.clone(),
        logger_cancel.clone(),
    );

    let scheduler = Scheduler::new(graph, store, client, config, period)
        .with_run_id(run_id)
        .with_event_bus(event_bus)
        .with_notifier(Arc::new(notifiers))
        .with_cancellation(cancel);
    let result = scheduler.run().await;

    if result.is_err() {
        logger_cancel.cancel();
    }
    if tokio::time::timeout(Duration::from_secs(5), logger).await.is_err() {
        logger_cancel.cancel();
    }

    let report = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", status::render_report(&report));
    }
    Ok(report.exit_code() as u8)
}

async fn show_status(
    config: &AppConfig,
    graph: &TaskGraph,
    run_dir: &Path,
    period_override: Option<String>,
) -> anyhow::Result<()> {
    let period = resolve_period(config, period_override);
    let (records, used) = if run_dir.exists() {
        let store = open_store(config, run_dir)?;
        let records: HashMap<String, _> = store
            .records()
            .await?
            .into_iter()
            .map(|r| (r.step_id.clone(), r))
            .collect();
        let used = store.current_period_usage(&period).await?;
        (records, used)
    } else {
        (HashMap::new(), 0)
    };

    println!("Run directory: {}", run_dir.display());
    print!(
        "{}",
        status::render_status(graph, &records, &period, used, config.budget.limit_units)
    );
    Ok(())
}

async fn reset_steps(
    config: &AppConfig,
    graph: &TaskGraph,
    run_dir: &Path,
    steps: Vec<String>,
    failed: bool,
) -> anyhow::Result<()> {
    if !run_dir.exists() {
        println!("Nothing to reset: {} does not exist", run_dir.display());
        return Ok(());
    }
    let store: Arc<dyn StateStore> = open_store(config, run_dir)?;

    let targets: Vec<String> = if failed {
        store
            .records()
            .await?
            .into_iter()
            .filter(|r| r.status == StepStatus::Failed && graph.contains(&r.step_id))
            .map(|r| r.step_id)
            .collect()
    } else {
        for id in &steps {
            if !graph.contains(id) {
                return Err(StepwiseError::Workflow(format!("unknown step: {}", id)).into());
            }
        }
        steps
    };

    if targets.is_empty() {
        println!("No steps to reset");
        return Ok(());
    }
    for id in &targets {
        if store.remove(id).await? {
            info!(step_id = %id, "Step reset");
            println!("  reset {}", id);
        } else {
            println!("  {} has no record", id);
        }
    }
    Ok(())
}
