//! OpenRouter worker: a rig agent on an OpenAI-compatible completions client.

use std::time::Duration;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use tracing::debug;

use super::Worker;
use crate::config::WorkerConfig;
use crate::errors::WorkerError;

/// Agent type built from an OpenAI-compatible endpoint.
pub type OaiAgent = Agent<openai::completion::CompletionModel>;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One prompt/answer pair kept in the worker's transcript.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub task: String,
    pub answer: String,
}

/// Worker backed by OpenRouter (or any OpenAI-compatible server).
///
/// Tool-less: the configured `tools` are meaningful to the Claude CLI backend
/// only. `max_iterations` caps the agent's turns per prompt. Every `run` is an
/// independent prompt; the transcript is kept for inspection and is not sent
/// back to the model.
pub struct OpenRouterWorker {
    agent: OaiAgent,
    model: String,
    transcript: Vec<Exchange>,
}

impl OpenRouterWorker {
    /// Must be called from within a tokio runtime: building the rig agent
    /// spawns its tool server task.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let api_key = config.api_key.as_ref().ok_or_else(|| {
            WorkerError::Unavailable("OpenRouter worker requires an api_key".into())
        })?;
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            WorkerError::Unavailable("OpenRouter worker requires a base_url".into())
        })?;

        let client = openai::CompletionsClient::builder()
            .api_key(api_key.expose())
            .base_url(base_url)
            .build()
            .map_err(|e| {
                WorkerError::Unavailable(format!("failed to build OpenRouter client: {e}"))
            })?;

        let mut builder = client
            .agent(&config.model)
            .name("heavy_worker")
            .preamble(&config.system_prompt)
            .default_max_turns(config.max_iterations as usize);
        if let Some(t) = config.temperature {
            builder = builder.temperature(t);
        }

        Ok(Self {
            agent: builder.build(),
            model: config.model.clone(),
            transcript: Vec::new(),
        })
    }

    /// Exchanges since the last reset.
    pub fn transcript(&self) -> &[Exchange] {
        &self.transcript
    }
}

#[async_trait]
impl Worker for OpenRouterWorker {
    async fn run(&mut self, task: &str) -> Result<String, WorkerError> {
        debug!(model = %self.model, task_len = task.len(), "openrouter prompt");
        let answer = self
            .agent
            .prompt(task)
            .await
            .map_err(|e| WorkerError::Inference(e.to_string()))?;
        self.transcript.push(Exchange {
            task: task.to_string(),
            answer: answer.clone(),
        });
        Ok(answer)
    }

    async fn reset(&mut self) -> Result<(), WorkerError> {
        self.transcript.clear();
        Ok(())
    }
}

/// Check if an inference endpoint is reachable (GET `{url}/models`).
pub async fn check_endpoint(url: &str) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    match reqwest::Client::new()
        .get(&models_url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
