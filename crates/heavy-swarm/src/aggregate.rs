//! Combining successful worker outputs into one answer.
//!
//! | Successes | Result                                              |
//! |-----------|-----------------------------------------------------|
//! | 0         | fixed "all agents failed" message, no worker call   |
//! | 1         | that payload, byte for byte, no worker call         |
//! | 2+        | one synthesis call; labelled concatenation on error |

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::errors::HeavyError;
use crate::executor::WorkerResult;
use crate::pool::WorkerPool;
use crate::prompts::{self, SYNTHESIS_PROMPT};

pub const ALL_FAILED_MESSAGE: &str = "All agents failed to provide results. Please try again.";

/// How the final answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    NoResults,
    Single,
    Synthesized,
    Concatenated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub answer: String,
    pub method: AggregationMethod,
}

pub struct Aggregator {
    pool: Arc<WorkerPool>,
    synthesis: Option<WorkerConfig>,
    template: String,
    preflight: bool,
}

impl Aggregator {
    /// `synthesis` is stripped of every tool. `None` means synthesis is
    /// unavailable and multi-result batches are concatenated.
    pub fn new(pool: Arc<WorkerPool>, synthesis: Option<WorkerConfig>) -> Self {
        Self {
            pool,
            synthesis: synthesis.map(WorkerConfig::without_tools),
            template: SYNTHESIS_PROMPT.to_string(),
            preflight: false,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Probe the backend with [`WorkerFactory::is_available`] before synthesis.
    ///
    /// [`WorkerFactory::is_available`]: crate::worker::WorkerFactory::is_available
    pub fn with_preflight(mut self, preflight: bool) -> Self {
        self.preflight = preflight;
        self
    }

    pub async fn aggregate(&self, results: &[WorkerResult], task: &str) -> String {
        self.aggregate_detailed(results, task).await.answer
    }

    pub async fn aggregate_detailed(&self, results: &[WorkerResult], task: &str) -> Aggregation {
        let successes: Vec<&WorkerResult> = results.iter().filter(|r| r.is_success()).collect();

        match successes.as_slice() {
            [] => {
                warn!(total = results.len(), "no successful results to aggregate");
                Aggregation {
                    answer: ALL_FAILED_MESSAGE.to_string(),
                    method: AggregationMethod::NoResults,
                }
            }
            [only] => Aggregation {
                answer: only.payload.clone(),
                method: AggregationMethod::Single,
            },
            many => match self.synthesize(many, task).await {
                Ok(answer) => Aggregation {
                    answer,
                    method: AggregationMethod::Synthesized,
                },
                Err(e) => {
                    warn!(
                        error = %e,
                        responses = many.len(),
                        "falling back to concatenated responses"
                    );
                    Aggregation {
                        answer: concatenate(many, task),
                        method: AggregationMethod::Concatenated,
                    }
                }
            },
        }
    }

    async fn synthesize(
        &self,
        successes: &[&WorkerResult],
        task: &str,
    ) -> Result<String, HeavyError> {
        let config = self
            .synthesis
            .as_ref()
            .ok_or_else(|| HeavyError::Synthesis("no synthesis worker configured".into()))?;

        if self.preflight && !self.pool.factory().is_available(config).await {
            return Err(HeavyError::Synthesis(format!(
                "{} backend unavailable",
                config.provider
            )));
        }

        let agent_responses: String = successes
            .iter()
            .map(|r| format!("=== AGENT {} RESPONSE ===\n{}\n\n", r.index + 1, r.payload))
            .collect();
        let num_responses = successes.len().to_string();
        let prompt = prompts::render(
            &self.template,
            &[
                ("num_responses", &num_responses),
                ("agent_responses", &agent_responses),
                ("user_input", task),
            ],
        );

        let mut checkout = self
            .pool
            .acquire(config)
            .await
            .map_err(|e| HeavyError::Synthesis(e.to_string()))?;
        debug!(responses = successes.len(), "synthesizing");
        let answer = checkout.run(&prompt).await;
        self.pool.release(checkout).await;

        let answer = answer.map_err(|e| HeavyError::Synthesis(e.to_string()))?;
        if answer.trim().is_empty() {
            return Err(HeavyError::Synthesis("synthesis returned an empty answer".into()));
        }
        info!(responses = successes.len(), "synthesis completed");
        Ok(answer)
    }
}

/// Labelled concatenation of successful payloads. Pure string formatting.
pub fn concatenate(successes: &[&WorkerResult], task: &str) -> String {
    let mut out = String::new();
    for r in successes {
        out.push_str(&format!("=== Agent {} Response ===\n", r.index + 1));
        out.push_str(&r.payload);
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "---\nThese {} responses were produced independently for: {task}\n\
         They could not be merged automatically, so they are listed as returned.",
        successes.len()
    ));
    out
}
