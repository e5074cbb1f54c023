//! Per-slot progress shared between the executor and external observers.
//!
//! All writes go through [`ProgressTracker::update`]; readers get a copy via
//! [`ProgressTracker::snapshot`], so a poller never sees a half-written map
//! and never holds the lock longer than one clone.
//!
//! Every `reset`/`initialize` starts a new generation. Slot tasks write via
//! [`ProgressTracker::update_in`], which drops writes from an earlier
//! generation and never moves a slot out of a terminal state, so a task that
//! outlives its batch cannot touch the next run's view.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Maximum characters kept from a failure reason.
pub const FAILURE_REASON_MAX_CHARS: usize = 30;

/// Live status of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum AgentStatus {
    Queued,
    Initializing,
    Processing,
    Completed,
    Failed(String),
}

impl AgentStatus {
    /// `Failed` with the reason cut to [`FAILURE_REASON_MAX_CHARS`].
    pub fn failed(reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        let truncated = match reason.char_indices().nth(FAILURE_REASON_MAX_CHARS) {
            Some((cut, _)) => reason[..cut].to_string(),
            None => reason,
        };
        Self::Failed(truncated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Initializing => write!(f, "INITIALIZING..."),
            Self::Processing => write!(f, "PROCESSING..."),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed(reason) => write!(f, "FAILED: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct ProgressInner {
    generation: u64,
    status: BTreeMap<usize, AgentStatus>,
    results: BTreeMap<usize, String>,
}

/// Status and raw payload per slot, behind one mutex.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the previous run.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.status.clear();
        inner.results.clear();
    }

    /// Mark slots `0..n` as queued.
    pub fn initialize(&self, n: usize) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.status = (0..n).map(|i| (i, AgentStatus::Queued)).collect();
        inner.results.clear();
    }

    /// The single write entry point. `result` is stored alongside the status
    /// when present.
    pub fn update(&self, index: usize, status: AgentStatus, result: Option<String>) {
        let mut inner = self.lock();
        inner.status.insert(index, status);
        if let Some(payload) = result {
            inner.results.insert(index, payload);
        }
    }

    /// Write on behalf of the run that started at `generation`.
    ///
    /// Returns `false`, leaving the map untouched, when that run has been
    /// superseded or the slot has already reached a terminal status.
    pub fn update_in(
        &self,
        generation: u64,
        index: usize,
        status: AgentStatus,
        result: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        if inner.status.get(&index).is_some_and(AgentStatus::is_terminal) {
            return false;
        }
        inner.status.insert(index, status);
        if let Some(payload) = result {
            inner.results.insert(index, payload);
        }
        true
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn snapshot(&self) -> BTreeMap<usize, AgentStatus> {
        self.lock().status.clone()
    }

    pub fn results(&self) -> BTreeMap<usize, String> {
        self.lock().results.clone()
    }

    /// Count of slots in `Completed` or `Failed`.
    pub fn finished(&self) -> usize {
        self.lock().status.values().filter(|s| s.is_terminal()).count()
    }
}
