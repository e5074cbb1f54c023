//! End-to-end orchestration with a scripted worker factory.
//!
//! No network or CLI: every worker answers from a per-model script, and the
//! factory records which configurations it was asked to build.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use heavy_swarm::config::MARK_COMPLETE_TOOL;
use heavy_swarm::{
    AgentStatus, AggregationMethod, OrchestrationPhase, Orchestrator, OrchestratorSettings,
    ProviderKind, ResultStatus, RetryPolicy, Worker, WorkerConfig, WorkerError, WorkerFactory,
    WorkerPool,
};

/// Behaviour of one scripted model.
#[derive(Clone)]
enum Script {
    /// Sleep, then answer with the task prefixed.
    Echo { delay: Duration },
    /// Always fail.
    Fail,
    /// Answer decomposition prompts with `questions`, synthesis prompts with `merged`.
    Orchestrator {
        questions: String,
        merged: Result<String, String>,
    },
}

struct ScriptedWorker {
    script: Script,
    prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(&mut self, task: &str) -> Result<String, WorkerError> {
        self.prompts.lock().unwrap().push(task.to_string());
        match &self.script {
            Script::Echo { delay } => {
                tokio::time::sleep(*delay).await;
                Ok(format!("answer: {task}"))
            }
            Script::Fail => Err(WorkerError::Inference("model overloaded".into())),
            Script::Orchestrator { questions, merged } => {
                if task.contains("JSON array") {
                    Ok(questions.clone())
                } else {
                    merged.clone().map_err(WorkerError::Inference)
                }
            }
        }
    }
}

struct ScriptedFactory {
    scripts: Vec<(String, Script)>,
    built: Mutex<Vec<WorkerConfig>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(model, script)| (model.to_string(), script))
                .collect(),
            built: Mutex::new(Vec::new()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn built_models(&self) -> Vec<String> {
        self.built
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.model.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerFactory for ScriptedFactory {
    async fn build(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>, WorkerError> {
        self.built.lock().unwrap().push(config.clone());
        let script = self
            .scripts
            .iter()
            .find(|(model, _)| *model == config.model)
            .map(|(_, script)| script.clone())
            .ok_or_else(|| WorkerError::Unavailable(format!("unknown model {}", config.model)))?;
        Ok(Box::new(ScriptedWorker {
            script,
            prompts: self.prompts.clone(),
        }))
    }
}

fn settings(slot_models: &[&str], timeout: Duration) -> OrchestratorSettings {
    OrchestratorSettings {
        num_agents: slot_models.len(),
        task_timeout: timeout,
        slot_configs: slot_models
            .iter()
            .map(|m| WorkerConfig::new(ProviderKind::ClaudeCode, *m))
            .collect(),
        orchestrator: WorkerConfig::new(ProviderKind::ClaudeCode, "orch"),
        question_prompt: heavy_swarm::prompts::QUESTION_GENERATION_PROMPT.to_string(),
        synthesis_prompt: heavy_swarm::prompts::SYNTHESIS_PROMPT.to_string(),
        decomposition_retry: RetryPolicy::exponential(3, Duration::from_secs(1)),
        synthesis_preflight: false,
        pool_capacity: 8,
    }
}

fn orch_script(questions: &str, merged: Result<&str, &str>) -> Script {
    Script::Orchestrator {
        questions: questions.to_string(),
        merged: merged.map(str::to_string).map_err(str::to_string),
    }
}

fn build(factory: Arc<ScriptedFactory>, settings: OrchestratorSettings) -> Orchestrator {
    let pool = Arc::new(WorkerPool::new(factory, settings.pool_capacity));
    Orchestrator::with_pool(settings, pool)
}

#[tokio::test(start_paused = true)]
async fn happy_path_decomposes_executes_and_synthesizes() {
    let echo = Script::Echo {
        delay: Duration::from_secs(1),
    };
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script(r#"["q1","q2","q3"]"#, Ok("final merged answer"))),
        ("fast", echo.clone()),
        ("other", echo),
    ]));
    let orch = build(
        factory.clone(),
        settings(&["fast", "other", "fast"], Duration::from_secs(60)),
    );

    let report = orch.orchestrate_report("How do tides work?").await;

    assert_eq!(report.subtasks, vec!["q1", "q2", "q3"]);
    assert_eq!(report.answer, "final merged answer");
    assert_eq!(report.method, AggregationMethod::Synthesized);
    assert_eq!(report.results.len(), 3);
    for (i, r) in report.results.iter().enumerate() {
        assert_eq!(r.index, i);
        assert_eq!(r.status, ResultStatus::Success);
    }
    assert_eq!(orch.phase(), OrchestrationPhase::Done);

    // The decomposition worker never sees the completion tool; the
    // synthesis worker sees no tools at all.
    let built = factory.built.lock().unwrap().clone();
    let orch_configs: Vec<_> = built.iter().filter(|c| c.model == "orch").collect();
    assert_eq!(orch_configs.len(), 2);
    assert!(orch_configs.iter().all(|c| !c.tools.contains(MARK_COMPLETE_TOOL)));
    assert!(orch_configs.iter().any(|c| c.tools.is_empty()));

    let prompts = factory.prompts.lock().unwrap().clone();
    let synthesis = prompts.last().unwrap();
    assert!(synthesis.contains("=== AGENT 1 RESPONSE ==="));
    assert!(synthesis.contains("answer: q3"));
    assert!(synthesis.contains("How do tides work?"));
}

#[tokio::test(start_paused = true)]
async fn malformed_decomposition_falls_back_after_retries() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script("I think you should ask about...", Ok("merged"))),
        ("w", Script::Echo { delay: Duration::ZERO }),
    ]));
    let orch = build(factory.clone(), settings(&["w", "w", "w"], Duration::from_secs(60)));

    let started = tokio::time::Instant::now();
    let report = orch.orchestrate_report("compare tea and coffee").await;

    assert_eq!(report.subtasks.len(), 3);
    assert!(report.subtasks.iter().all(|s| s.contains("compare tea and coffee")));
    // Three decomposition attempts with 1s + 2s of backoff between them.
    let decomposition_calls = factory
        .prompts
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.contains("JSON array"))
        .count();
    assert_eq!(decomposition_calls, 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(report.answer, "merged");
}

#[tokio::test(start_paused = true)]
async fn slow_slot_times_out_and_the_rest_still_answer() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script(r#"["a","b","c"]"#, Ok("merged"))),
        ("quick", Script::Echo { delay: Duration::from_secs(2) }),
        ("slow", Script::Echo { delay: Duration::from_secs(500) }),
    ]));
    let orch = build(
        factory,
        settings(&["quick", "slow", "quick"], Duration::from_secs(30)),
    );

    let report = orch.orchestrate_report("task").await;

    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ResultStatus::Success, ResultStatus::Timeout, ResultStatus::Success]
    );
    assert_eq!(report.results[1].payload, "Agent 2 timed out after 30s");
    assert_eq!(report.method, AggregationMethod::Synthesized);
    assert!(matches!(orch.snapshot_progress()[&1], AgentStatus::Failed(_)));
}

#[tokio::test(start_paused = true)]
async fn failed_synthesis_concatenates_successes() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script(r#"["a","b","c"]"#, Err("synthesis backend down"))),
        ("ok", Script::Echo { delay: Duration::ZERO }),
        ("bad", Script::Fail),
    ]));
    let orch = build(factory, settings(&["ok", "bad", "ok"], Duration::from_secs(30)));

    let report = orch.orchestrate_report("why is the sky blue").await;

    assert_eq!(report.method, AggregationMethod::Concatenated);
    assert!(report.answer.contains("=== Agent 1 Response ===\nanswer: a"));
    assert!(report.answer.contains("=== Agent 3 Response ===\nanswer: c"));
    assert!(!report.answer.contains("Agent 2 Response"));
    assert!(report.answer.contains("why is the sky blue"));
    assert_eq!(report.results[1].status, ResultStatus::Error);
    assert!(report.results[1].payload.contains("model overloaded"));
}

#[tokio::test(start_paused = true)]
async fn every_slot_failing_yields_all_failed_message() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script(r#"["a","b"]"#, Ok("unused"))),
        ("bad", Script::Fail),
    ]));
    let orch = build(factory.clone(), settings(&["bad", "bad"], Duration::from_secs(30)));

    let answer = orch.orchestrate("anything").await.to_lowercase();

    assert!(answer.contains("all agents failed"));
    // Decomposition only; no synthesis worker was needed.
    let orch_builds = factory
        .built_models()
        .iter()
        .filter(|m| m.as_str() == "orch")
        .count();
    assert_eq!(orch_builds, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_slot_model_is_a_per_slot_error() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script(r#"["a","b"]"#, Ok("unused"))),
        ("ok", Script::Echo { delay: Duration::ZERO }),
    ]));
    let orch = build(factory, settings(&["ok", "missing"], Duration::from_secs(30)));

    let report = orch.orchestrate_report("x").await;

    assert_eq!(report.results[1].status, ResultStatus::Error);
    assert!(report.results[1].payload.contains("unknown model missing"));
    assert_eq!(report.method, AggregationMethod::Single);
    assert_eq!(report.answer, "answer: a");
}

#[tokio::test(start_paused = true)]
async fn progress_snapshot_mid_run_covers_every_slot() {
    let factory = Arc::new(ScriptedFactory::new(vec![
        ("orch", orch_script(r#"["a","b","c"]"#, Ok("merged"))),
        ("slow", Script::Echo { delay: Duration::from_secs(5) }),
        ("slower", Script::Echo { delay: Duration::from_secs(9) }),
    ]));
    let orch = build(
        factory,
        settings(&["slow", "slower", "slow"], Duration::from_secs(60)),
    );

    let observe = async {
        let mut mid_run = 0;
        let mut finished = [false; 3];
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            match orch.phase() {
                OrchestrationPhase::Executing => {
                    let snapshot = orch.snapshot_progress();
                    assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
                    for (index, status) in &snapshot {
                        // A slot never leaves a terminal status.
                        assert!(!finished[*index] || status.is_terminal());
                        finished[*index] = status.is_terminal();
                    }
                    if snapshot.values().any(|s| !s.is_terminal()) {
                        mid_run += 1;
                    }
                }
                OrchestrationPhase::Done => break mid_run,
                _ => {}
            }
        }
    };

    let (report, mid_run) = tokio::join!(orch.orchestrate_report("task"), observe);

    assert!(mid_run > 0);
    assert!(report.results.iter().all(|r| r.status == ResultStatus::Success));
    assert!(orch
        .snapshot_progress()
        .values()
        .all(|s| *s == AgentStatus::Completed));
}
