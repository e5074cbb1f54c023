//! Top-level run: decompose → execute in parallel → aggregate.
//!
//! ```text
//! Idle ─▶ Decomposing ─▶ Executing ─▶ Aggregating ─▶ Done
//! ```
//!
//! One `Orchestrator` runs one orchestration at a time; concurrent callers
//! queue on the run guard. Progress for the run in flight is readable at any
//! moment through [`Orchestrator::snapshot_progress`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::aggregate::{AggregationMethod, Aggregator};
use crate::config::{HeavyConfig, WorkerConfig, WorkerRole};
use crate::decompose::Decomposer;
use crate::errors::HeavyError;
use crate::executor::{ParallelExecutor, WorkerResult};
use crate::pool::WorkerPool;
use crate::progress::{AgentStatus, ProgressTracker};
use crate::prompts::PROMPT_VERSION;
use crate::retry::RetryPolicy;

/// Phase of the run currently holding the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationPhase {
    Idle,
    Decomposing,
    Executing,
    Aggregating,
    Done,
}

impl fmt::Display for OrchestrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Decomposing => "decomposing",
            Self::Executing => "executing",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Everything an orchestrator needs, resolved up front.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub num_agents: usize,
    pub task_timeout: Duration,
    /// One config per worker slot.
    pub slot_configs: Vec<WorkerConfig>,
    /// Decomposition and synthesis worker.
    pub orchestrator: WorkerConfig,
    pub question_prompt: String,
    pub synthesis_prompt: String,
    pub decomposition_retry: RetryPolicy,
    pub synthesis_preflight: bool,
    pub pool_capacity: usize,
}

impl OrchestratorSettings {
    /// Resolve every role. Any configuration error surfaces here, before a
    /// worker is built.
    pub fn from_config(config: &HeavyConfig) -> Result<Self, HeavyError> {
        let num_agents = config.num_agents();
        let orch = &config.orchestrator;
        Ok(Self {
            num_agents,
            task_timeout: config.task_timeout(),
            slot_configs: config.resolve_slots(num_agents)?,
            orchestrator: config.resolve(WorkerRole::Orchestrator)?,
            question_prompt: orch.question_generation_prompt.clone(),
            synthesis_prompt: orch.synthesis_prompt.clone(),
            decomposition_retry: config.decomposition_retry(),
            synthesis_preflight: orch.synthesis_preflight,
            pool_capacity: orch.pool_capacity,
        })
    }
}

/// Per-run record returned by [`Orchestrator::orchestrate_report`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task: String,
    pub subtasks: Vec<String>,
    pub results: Vec<WorkerResult>,
    pub answer: String,
    pub method: AggregationMethod,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }
}

pub struct Orchestrator {
    num_agents: usize,
    decomposer: Decomposer,
    executor: ParallelExecutor,
    aggregator: Aggregator,
    progress: Arc<ProgressTracker>,
    phase: Mutex<OrchestrationPhase>,
    run_guard: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Build from a config file's contents, sharing the process-wide pool.
    pub fn from_config(config: &HeavyConfig) -> Result<Self, HeavyError> {
        let settings = OrchestratorSettings::from_config(config)?;
        let pool = WorkerPool::global_with_capacity(settings.pool_capacity);
        Ok(Self::with_pool(settings, pool))
    }

    pub fn with_pool(settings: OrchestratorSettings, pool: Arc<WorkerPool>) -> Self {
        let progress = Arc::new(ProgressTracker::new());
        let decomposer = Decomposer::new(pool.clone(), settings.orchestrator.clone())
            .with_template(settings.question_prompt)
            .with_retry(settings.decomposition_retry);
        let executor = ParallelExecutor::new(
            pool.clone(),
            progress.clone(),
            settings.slot_configs,
            settings.task_timeout,
        );
        let aggregator = Aggregator::new(pool, Some(settings.orchestrator))
            .with_template(settings.synthesis_prompt)
            .with_preflight(settings.synthesis_preflight);

        Self {
            num_agents: settings.num_agents,
            decomposer,
            executor,
            aggregator,
            progress,
            phase: Mutex::new(OrchestrationPhase::Idle),
            run_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    pub fn phase(&self) -> OrchestrationPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: OrchestrationPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        info!(%phase, "orchestration phase");
    }

    /// Point-in-time copy of every slot's status.
    pub fn snapshot_progress(&self) -> BTreeMap<usize, AgentStatus> {
        self.progress.snapshot()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Run one orchestration and return the final answer.
    pub async fn orchestrate(&self, task: &str) -> String {
        self.orchestrate_report(task).await.answer
    }

    /// Run one orchestration and return everything it produced.
    pub async fn orchestrate_report(&self, task: &str) -> RunReport {
        let _guard = self.run_guard.lock().await;
        let span = info_span!(
            "orchestrate",
            agents = self.num_agents,
            prompt_version = PROMPT_VERSION
        );
        self.run(task).instrument(span).await
    }

    async fn run(&self, task: &str) -> RunReport {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        self.progress.reset();

        self.set_phase(OrchestrationPhase::Decomposing);
        let subtasks = self.decomposer.decompose(task, self.num_agents).await;

        self.set_phase(OrchestrationPhase::Executing);
        self.progress.initialize(subtasks.len());
        let results = self.executor.run(&subtasks).await;

        self.set_phase(OrchestrationPhase::Aggregating);
        let aggregation = self.aggregator.aggregate_detailed(&results, task).await;

        self.set_phase(OrchestrationPhase::Done);
        let elapsed = clock.elapsed();
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            method = ?aggregation.method,
            "orchestration finished"
        );

        RunReport {
            task: task.to_string(),
            subtasks,
            results,
            answer: aggregation.answer,
            method: aggregation.method,
            started_at,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::errors::WorkerError;
    use crate::worker::{Worker, WorkerFactory};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Orchestrator model answers decomposition and synthesis prompts;
    /// slot models echo their subtask.
    struct EchoWorker {
        model: String,
    }

    #[async_trait]
    impl Worker for EchoWorker {
        async fn run(&mut self, task: &str) -> Result<String, WorkerError> {
            match self.model.as_str() {
                "orch" if task.contains("JSON array") => Ok(r#"["first", "second"]"#.into()),
                "orch" => Ok("synthesized".into()),
                "broken" => Err(WorkerError::Inference("down".into())),
                _ => Ok(format!("echo {task}")),
            }
        }
    }

    #[derive(Default)]
    struct EchoFactory {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl WorkerFactory for EchoFactory {
        async fn build(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>, WorkerError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoWorker {
                model: config.model.clone(),
            }))
        }
    }

    fn settings(slots: &[&str]) -> OrchestratorSettings {
        OrchestratorSettings {
            num_agents: slots.len(),
            task_timeout: Duration::from_secs(30),
            slot_configs: slots
                .iter()
                .map(|m| WorkerConfig::new(ProviderKind::ClaudeCode, *m))
                .collect(),
            orchestrator: WorkerConfig::new(ProviderKind::ClaudeCode, "orch"),
            question_prompt: crate::prompts::QUESTION_GENERATION_PROMPT.to_string(),
            synthesis_prompt: crate::prompts::SYNTHESIS_PROMPT.to_string(),
            decomposition_retry: RetryPolicy::none(),
            synthesis_preflight: false,
            pool_capacity: 8,
        }
    }

    fn orchestrator(slots: &[&str]) -> (Orchestrator, Arc<EchoFactory>) {
        let factory = Arc::new(EchoFactory::default());
        let pool = Arc::new(WorkerPool::new(factory.clone(), 8));
        (Orchestrator::with_pool(settings(slots), pool), factory)
    }

    #[tokio::test]
    async fn full_run_synthesizes_and_reports() {
        let (orch, _) = orchestrator(&["a", "b"]);
        assert_eq!(orch.phase(), OrchestrationPhase::Idle);

        let report = orch.orchestrate_report("what is rust").await;
        assert_eq!(report.subtasks, vec!["first", "second"]);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].payload, "echo first");
        assert_eq!(report.answer, "synthesized");
        assert_eq!(report.method, AggregationMethod::Synthesized);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(orch.phase(), OrchestrationPhase::Done);

        let progress = orch.snapshot_progress();
        assert_eq!(progress.len(), 2);
        assert!(progress.values().all(|s| *s == AgentStatus::Completed));
    }

    #[tokio::test]
    async fn one_broken_slot_still_answers() {
        let (orch, _) = orchestrator(&["a", "broken"]);
        let report = orch.orchestrate_report("q").await;
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.method, AggregationMethod::Single);
        assert_eq!(report.answer, "echo first");
    }

    #[tokio::test]
    async fn second_run_reuses_pooled_workers() {
        let (orch, factory) = orchestrator(&["a", "b"]);
        orch.orchestrate("q").await;
        let after_first = factory.builds.load(Ordering::SeqCst);
        orch.orchestrate("q").await;
        assert_eq!(factory.builds.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn concurrent_runs_are_serialized() {
        let (orch, _) = orchestrator(&["a", "b", "c"]);
        let orch = Arc::new(orch);
        let (x, y) = tokio::join!(orch.orchestrate_report("x"), orch.orchestrate_report("y"));
        // Decomposition returns two subtasks for three slots, so each run
        // falls back to three template subtasks.
        assert_eq!(x.results.len(), 3);
        assert_eq!(y.results.len(), 3);
        assert_eq!(orch.snapshot_progress().len(), 3);
    }

    #[test]
    fn settings_surface_configuration_errors() {
        let text = r#"
provider = "openrouter"
[openrouter]
api_key = "k"
model = "m"
[orchestrator]
parallel_agents = 2
"#;
        let config = HeavyConfig::from_toml_str(text).unwrap();
        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert_eq!(settings.slot_configs.len(), 2);
        assert_eq!(settings.orchestrator.model, "m");
    }
}
