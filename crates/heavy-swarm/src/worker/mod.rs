//! Worker abstraction and the factory that builds concrete workers.
//!
//! A [`Worker`] takes one task string and returns one answer string via an
//! external inference call. The backend is chosen exactly once, in
//! [`HeavyWorkerFactory::build`]; nothing downstream branches on provider.
//!
//! | Provider      | Worker              | Transport                         |
//! |---------------|---------------------|-----------------------------------|
//! | `openrouter`  | `OpenRouterWorker`  | rig OpenAI-compatible completions |
//! | `claude_code` | `ClaudeCliWorker`   | `claude -p` subprocess, stream-json |

pub mod claude_cli;
pub mod openrouter;

use async_trait::async_trait;

use crate::config::{ProviderKind, WorkerConfig};
use crate::errors::WorkerError;

pub use claude_cli::ClaudeCliWorker;
pub use openrouter::OpenRouterWorker;

/// A unit that answers one task via an external inference call.
///
/// Workers carry mutable conversation state, so a worker is only ever held by
/// one caller at a time; the pool enforces this by moving ownership.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Worker: Send {
    /// Run one task to completion. Implementations enforce their own
    /// iteration ceiling.
    async fn run(&mut self, task: &str) -> Result<String, WorkerError>;

    /// Clear per-task state before the worker is pooled again.
    async fn reset(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Builds workers for a resolved configuration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Construct a worker. Fails on missing credentials, missing CLI binary,
    /// invalid model, etc.
    async fn build(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>, WorkerError>;

    /// Cheap preflight: can a worker for `config` answer right now?
    async fn is_available(&self, _config: &WorkerConfig) -> bool {
        true
    }
}

/// Production factory: OpenRouter over HTTP or the Claude Code CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeavyWorkerFactory;

#[async_trait]
impl WorkerFactory for HeavyWorkerFactory {
    async fn build(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>, WorkerError> {
        match config.provider {
            ProviderKind::OpenRouter => Ok(Box::new(OpenRouterWorker::from_config(config)?)),
            ProviderKind::ClaudeCode => Ok(Box::new(ClaudeCliWorker::from_config(config).await?)),
        }
    }

    async fn is_available(&self, config: &WorkerConfig) -> bool {
        match config.provider {
            ProviderKind::OpenRouter => match config.base_url.as_deref() {
                Some(url) => openrouter::check_endpoint(url).await,
                None => false,
            },
            ProviderKind::ClaudeCode => match ClaudeCliWorker::command_line(config) {
                Ok((program, prefix)) => claude_cli::verify_cli(&program, &prefix).await.is_ok(),
                Err(_) => false,
            },
        }
    }
}
