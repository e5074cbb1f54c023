//! Heavy Swarm: multi-worker LLM orchestration.
//!
//! One task is split into N subtasks, each answered by its own worker in
//! parallel, and the answers are merged into one response.
//!
//! # Pipeline
//!
//! ```text
//! task ─▶ Decomposer ─▶ [subtask 0..N] ─▶ ParallelExecutor ─▶ [WorkerResult 0..N] ─▶ Aggregator ─▶ answer
//!              │                               │                                         │
//!              └────────────── WorkerPool (fingerprint-keyed, LRU) ─────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: TOML config with layered per-worker resolution
//! - [`worker`]: `Worker` / `WorkerFactory` traits, OpenRouter and Claude CLI backends
//! - [`pool`]: reusable workers keyed by [`fingerprint::ConfigFingerprint`]
//! - [`decompose`], [`executor`], [`aggregate`]: the three phases
//! - [`orchestrator`]: runs the phases and exposes live progress
//!
//! # Usage
//!
//! ```bash
//! heavy-swarm --config config.toml "What are the trade-offs of CRDTs?"
//!
//! # Interactive, more verbose
//! RUST_LOG=heavy_swarm=debug heavy-swarm --agents 6
//! ```

pub mod aggregate;
pub mod config;
pub mod decompose;
pub mod errors;
pub mod executor;
pub mod fingerprint;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod worker;

pub use aggregate::{Aggregation, AggregationMethod, Aggregator};
pub use config::{HeavyConfig, ProviderKind, WorkerConfig, WorkerRole};
pub use decompose::Decomposer;
pub use errors::{HeavyError, WorkerError};
pub use executor::{ParallelExecutor, ResultStatus, WorkerResult};
pub use fingerprint::ConfigFingerprint;
pub use orchestrator::{OrchestrationPhase, Orchestrator, OrchestratorSettings, RunReport};
pub use pool::{PoolStats, WorkerPool};
pub use progress::{AgentStatus, ProgressTracker};
pub use retry::RetryPolicy;
pub use worker::{HeavyWorkerFactory, Worker, WorkerFactory};
