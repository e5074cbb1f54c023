//! Parallel execution of one subtask batch under a single deadline.
//!
//! ```text
//! subtasks[0..n] ──JoinSet::spawn──▶ slot 0..n: acquire → run → release
//!                                      │
//!        timeout_at(deadline) ◀────────┘ join_next_with_id
//!                │
//!                └─ on expiry: abort_all, unfinished slots → timeout
//! ```
//!
//! The result vector always has exactly `n` entries ordered by slot index.
//! Aborting a task drops its future at the next `.await`; blocking code
//! inside a worker keeps running until it yields. Such a straggler finds its
//! slot already terminal (or its run superseded) and drops its worker
//! instead of returning it to the pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::errors::{HeavyError, WorkerError};
use crate::pool::WorkerPool;
use crate::progress::{AgentStatus, ProgressTracker};

/// Terminal state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
    Timeout,
}

/// Outcome of one slot, recorded exactly once per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerResult {
    pub index: usize,
    pub status: ResultStatus,
    pub payload: String,
    pub duration: Duration,
}

impl WorkerResult {
    pub fn success(index: usize, payload: String, duration: Duration) -> Self {
        Self {
            index,
            status: ResultStatus::Success,
            payload,
            duration,
        }
    }

    pub fn error(index: usize, error: impl std::fmt::Display, duration: Duration) -> Self {
        Self {
            index,
            status: ResultStatus::Error,
            payload: format!("Error: {error}"),
            duration,
        }
    }

    pub fn timeout(index: usize, after: Duration) -> Self {
        Self {
            index,
            status: ResultStatus::Timeout,
            payload: format!("Agent {} timed out after {}s", index + 1, after.as_secs()),
            duration: after,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Runs one worker per subtask, each against its own slot configuration.
pub struct ParallelExecutor {
    pool: Arc<WorkerPool>,
    progress: Arc<ProgressTracker>,
    slot_configs: Vec<WorkerConfig>,
    timeout: Duration,
}

impl ParallelExecutor {
    pub fn new(
        pool: Arc<WorkerPool>,
        progress: Arc<ProgressTracker>,
        slot_configs: Vec<WorkerConfig>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            progress,
            slot_configs,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Slots past the configured list reuse the last configuration.
    fn config_for(&self, index: usize) -> Option<&WorkerConfig> {
        self.slot_configs
            .get(index)
            .or_else(|| self.slot_configs.last())
    }

    /// Run every subtask with the executor's timeout as the batch deadline.
    pub async fn run(&self, subtasks: &[String]) -> Vec<WorkerResult> {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.run_until(subtasks, deadline).await
    }

    /// Run every subtask; anything unfinished at `deadline` becomes a timeout.
    pub async fn run_until(&self, subtasks: &[String], deadline: Instant) -> Vec<WorkerResult> {
        let started = Instant::now();
        let n = subtasks.len();
        let generation = self.progress.generation();
        let mut results: BTreeMap<usize, WorkerResult> = BTreeMap::new();
        let mut slots = HashMap::with_capacity(n);
        let mut set = JoinSet::new();

        for (index, subtask) in subtasks.iter().enumerate() {
            let Some(config) = self.config_for(index).cloned() else {
                let err = WorkerError::Unavailable("no worker configuration for slot".into());
                self.progress.update(index, AgentStatus::failed(&err), None);
                results.insert(index, WorkerResult::error(index, err, Duration::ZERO));
                continue;
            };
            let handle = set.spawn(run_slot(
                self.pool.clone(),
                self.progress.clone(),
                generation,
                index,
                config,
                subtask.clone(),
            ));
            slots.insert(handle.id(), index);
        }
        info!(n, timeout_secs = self.timeout.as_secs(), "batch started");

        let collected = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = set.join_next_with_id().await {
                match joined {
                    Ok((_, result)) => {
                        results.insert(result.index, result);
                    }
                    Err(join_err) => {
                        let Some(&index) = slots.get(&join_err.id()) else {
                            error!(error = %join_err, "join error for unknown task");
                            continue;
                        };
                        error!(index, error = %join_err, "worker task panicked");
                        self.progress
                            .update(index, AgentStatus::failed("worker task panicked"), None);
                        results.insert(
                            index,
                            WorkerResult::error(index, "worker task panicked", started.elapsed()),
                        );
                    }
                }
            }
        })
        .await;

        if collected.is_err() {
            set.abort_all();
            let after = started.elapsed();
            let missing: Vec<usize> = (0..n).filter(|i| !results.contains_key(i)).collect();
            for index in missing {
                let err = HeavyError::Timeout { index, after };
                warn!(index, error = %err, "slot timed out");
                self.progress
                    .update(index, AgentStatus::failed("timed out"), None);
                results.insert(index, WorkerResult::timeout(index, after));
            }
        }

        let ordered: Vec<WorkerResult> = results.into_values().collect();
        let succeeded = ordered.iter().filter(|r| r.is_success()).count();
        info!(
            n,
            succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        ordered
    }
}

async fn run_slot(
    pool: Arc<WorkerPool>,
    progress: Arc<ProgressTracker>,
    generation: u64,
    index: usize,
    config: WorkerConfig,
    subtask: String,
) -> WorkerResult {
    let started = Instant::now();
    progress.update_in(generation, index, AgentStatus::Initializing, None);
    debug!(index, model = %config.model, "slot initializing");

    let mut checkout = match pool.acquire(&config).await {
        Ok(checkout) => checkout,
        Err(source) => {
            return slot_failed(&progress, generation, index, source, started.elapsed());
        }
    };
    progress.update_in(generation, index, AgentStatus::Processing, None);
    let outcome = checkout.run(&subtask).await;
    let duration = started.elapsed();

    let (recorded, result) = match outcome {
        Ok(payload) => {
            debug!(index, elapsed_ms = duration.as_millis() as u64, "slot completed");
            let recorded = progress.update_in(
                generation,
                index,
                AgentStatus::Completed,
                Some(payload.clone()),
            );
            (recorded, WorkerResult::success(index, payload, duration))
        }
        Err(source) => {
            let result = WorkerResult::error(index, &source, duration);
            let recorded = progress.update_in(
                generation,
                index,
                AgentStatus::failed(&source),
                Some(result.payload.clone()),
            );
            let err = HeavyError::Worker { index, source };
            warn!(error = %err, "slot failed");
            (recorded, result)
        }
    };

    if recorded {
        pool.release(checkout).await;
    } else {
        // The batch already gave up on this slot.
        debug!(index, "late slot finished after its batch ended, dropping worker");
        drop(checkout);
    }
    result
}

fn slot_failed(
    progress: &ProgressTracker,
    generation: u64,
    index: usize,
    source: WorkerError,
    duration: Duration,
) -> WorkerResult {
    let result = WorkerResult::error(index, &source, duration);
    progress.update_in(
        generation,
        index,
        AgentStatus::failed(&source),
        Some(result.payload.clone()),
    );
    let err = HeavyError::Worker { index, source };
    warn!(error = %err, "slot failed");
    result
}
