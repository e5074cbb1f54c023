//! `heavy-swarm` command-line entry point.
//!
//! ```bash
//! # One-shot
//! heavy-swarm --config config.toml "Explain consensus algorithms"
//!
//! # Interactive (type `quit` or `exit`, or send EOF, to stop)
//! heavy-swarm --agents 6 --timeout 600
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use heavy_swarm::{HeavyConfig, Orchestrator, ProgressTracker};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// How often live progress is logged while a run is in flight.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Number of parallel workers (overrides orchestrator.parallel_agents)
    #[arg(long)]
    agents: Option<usize>,

    /// Batch deadline in seconds (overrides orchestrator.task_timeout_secs)
    #[arg(long)]
    timeout: Option<u64>,

    /// Task to run once. Without it, tasks are read from stdin line by line.
    task: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = HeavyConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(agents) = args.agents {
        config.orchestrator.parallel_agents = agents;
    }
    if let Some(timeout) = args.timeout {
        config.orchestrator.task_timeout_secs = timeout;
    }
    config.validate().context("invalid configuration")?;

    let orchestrator = Orchestrator::from_config(&config).context("building orchestrator")?;
    info!(
        provider = ?config.provider,
        agents = orchestrator.num_agents(),
        timeout_secs = config.orchestrator.task_timeout_secs,
        "heavy-swarm ready"
    );

    match args.task {
        Some(task) => run_once(&orchestrator, &task).await,
        None => interactive(&orchestrator).await?,
    }
    Ok(())
}

async fn run_once(orchestrator: &Orchestrator, task: &str) {
    let monitor = tokio::spawn(log_progress(orchestrator.progress()));
    let report = orchestrator.orchestrate_report(task).await;
    monitor.abort();

    info!(
        succeeded = report.succeeded(),
        total = report.results.len(),
        method = ?report.method,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "run complete"
    );
    println!("{}", report.answer);
}

async fn interactive(orchestrator: &Orchestrator) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Enter a task (or 'quit' to exit):");
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        if matches!(task.to_lowercase().as_str(), "quit" | "exit") {
            break;
        }
        run_once(orchestrator, task).await;
        println!("\nEnter a task (or 'quit' to exit):");
    }
    Ok(())
}

async fn log_progress(progress: Arc<ProgressTracker>) {
    let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = progress.snapshot();
        if snapshot.is_empty() {
            continue;
        }
        let line = snapshot
            .iter()
            .map(|(index, status)| format!("agent {}: {status}", index + 1))
            .collect::<Vec<_>>()
            .join(" | ");
        if snapshot.values().any(|s| matches!(s, heavy_swarm::AgentStatus::Failed(_))) {
            warn!(progress = %line, "progress");
        } else {
            info!(progress = %line, "progress");
        }
    }
}
