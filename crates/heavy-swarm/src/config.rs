//! Layered configuration for workers and the orchestrator.
//!
//! A TOML file describes a global provider, provider sections, orchestrator
//! settings and optional per-agent overrides. Every worker slot is resolved
//! into one immutable [`WorkerConfig`] by folding override layers in
//! [`LAYER_PRECEDENCE`] order (lowest first):
//!
//! | Layer      | Source                                             |
//! |------------|----------------------------------------------------|
//! | `Defaults` | built-in defaults, top-level `system_prompt`, `[agent]` |
//! | `Provider` | `[openrouter]` / `[claude_code]` of the effective provider |
//! | `Agent`    | `[agents.agent_<k>]`, or `[orchestrator]` for the orchestrator role |
//!
//! The effective provider is the role's own `provider` override if present,
//! else the global `provider`. Switching provider per agent therefore pulls
//! in that provider's section as the middle layer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::HeavyError;
use crate::fingerprint::ConfigFingerprint;
use crate::prompts;
use crate::retry::RetryPolicy;

/// Default OpenRouter API base URL.
pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Default Claude Code CLI binary.
pub const DEFAULT_CLI_PATH: &str = "claude";
/// Default number of parallel worker slots.
pub const DEFAULT_PARALLEL_AGENTS: usize = 4;
/// Default batch deadline in seconds.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
/// Default agentic-loop ceiling per worker call.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
/// Default number of idle workers kept by the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 8;
/// Decomposition attempts before the template fallback.
pub const DEFAULT_DECOMPOSITION_ATTEMPTS: u32 = 3;
/// First decomposition backoff; doubles after each failure.
pub const DEFAULT_DECOMPOSITION_BACKOFF_MS: u64 = 1_000;
/// Tool that ends a worker's agentic loop early.
pub const MARK_COMPLETE_TOOL: &str = "mark_task_complete";
/// Tools enabled when the config does not list any.
pub const DEFAULT_TOOLS: &[&str] = &[
    "search_web",
    "calculate",
    "read_file",
    "write_file",
    MARK_COMPLETE_TOOL,
];

const ENV_OPENROUTER_API_KEY: &str = "OPENROUTER_API_KEY";

// ── Provider / secrets ───────────────────────────────────────────────────────

/// Backend a worker talks to. Chosen once, at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions via OpenRouter.
    #[serde(rename = "openrouter")]
    OpenRouter,
    /// Claude Code CLI subprocess.
    #[serde(rename = "claude_code")]
    ClaudeCode,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenRouter => write!(f, "openrouter"),
            Self::ClaudeCode => write!(f, "claude_code"),
        }
    }
}

/// API credential. Never printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

// ── Override layers ──────────────────────────────────────────────────────────

/// One configuration layer. Every field is optional; `overlay` lets the
/// upper layer win field by field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkerOverrides {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub tools: Option<Vec<String>>,
    pub base_url: Option<String>,
    pub api_key: Option<ApiKey>,
    pub cli_path: Option<String>,
}

impl WorkerOverrides {
    /// Return `self` with every field set in `upper` replaced.
    pub fn overlay(self, upper: &WorkerOverrides) -> Self {
        Self {
            provider: upper.provider.or(self.provider),
            model: upper.model.clone().or(self.model),
            temperature: upper.temperature.or(self.temperature),
            system_prompt: upper.system_prompt.clone().or(self.system_prompt),
            max_iterations: upper.max_iterations.or(self.max_iterations),
            tools: upper.tools.clone().or(self.tools),
            base_url: upper.base_url.clone().or(self.base_url),
            api_key: upper.api_key.clone().or(self.api_key),
            cli_path: upper.cli_path.clone().or(self.cli_path),
        }
    }
}

/// Named configuration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    Defaults,
    Provider,
    Agent,
}

/// Fold order for override layers, lowest precedence first.
pub const LAYER_PRECEDENCE: [ConfigLayer; 3] =
    [ConfigLayer::Defaults, ConfigLayer::Provider, ConfigLayer::Agent];

/// Which worker a configuration is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Parallel worker slot, 0-based.
    Agent(usize),
    /// Decomposition / synthesis worker.
    Orchestrator,
}

/// Config key for a 0-based worker index (`agent_1`, `agent_2`, ...).
pub fn agent_id(index: usize) -> String {
    format!("agent_{}", index + 1)
}

// ── Resolved worker config ───────────────────────────────────────────────────

/// Fully resolved, immutable configuration of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: Option<f64>,
    pub system_prompt: String,
    pub max_iterations: u32,
    pub tools: BTreeSet<String>,
    /// OpenRouter only.
    pub base_url: Option<String>,
    /// OpenRouter only.
    pub api_key: Option<ApiKey>,
    /// Claude Code only. May carry leading arguments (`npx claude`).
    pub cli_path: Option<String>,
}

impl WorkerConfig {
    /// Config with built-in defaults for the given provider and model.
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        let (base_url, cli_path) = match provider {
            ProviderKind::OpenRouter => (Some(DEFAULT_OPENROUTER_BASE_URL.to_string()), None),
            ProviderKind::ClaudeCode => (None, Some(DEFAULT_CLI_PATH.to_string())),
        };
        Self {
            provider,
            model: model.into(),
            temperature: None,
            system_prompt: prompts::DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tools: DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect(),
            base_url,
            api_key: None,
            cli_path,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(ApiKey::new(key));
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Drop one tool. The result has a different fingerprint, so it pools
    /// separately from the full-tool variant.
    pub fn without_tool(mut self, name: &str) -> Self {
        self.tools.remove(name);
        self
    }

    /// Drop every tool, forcing a direct textual answer.
    pub fn without_tools(mut self) -> Self {
        self.tools.clear();
        self
    }

    pub fn fingerprint(&self) -> ConfigFingerprint {
        ConfigFingerprint::of(self)
    }

    fn from_layers(
        provider: ProviderKind,
        merged: WorkerOverrides,
        role: WorkerRole,
    ) -> Result<Self, HeavyError> {
        let who = match role {
            WorkerRole::Agent(i) => agent_id(i),
            WorkerRole::Orchestrator => "orchestrator".to_string(),
        };

        let model = merged
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| {
                HeavyError::config(format!("{who}: no model configured for {provider}"))
            })?;

        if let Some(t) = merged.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(HeavyError::config(format!(
                    "{who}: temperature must be in [0, 2], got {t}"
                )));
            }
        }

        let max_iterations = merged.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            return Err(HeavyError::config(format!("{who}: max_iterations must be > 0")));
        }

        let tools = match merged.tools {
            Some(list) => list.into_iter().collect(),
            None => DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect(),
        };

        let (base_url, api_key, cli_path) = match provider {
            ProviderKind::OpenRouter => {
                let key = merged.api_key.ok_or_else(|| {
                    HeavyError::config(format!("{who}: OpenRouter provider requires 'api_key'"))
                })?;
                let url = merged
                    .base_url
                    .unwrap_or_else(|| DEFAULT_OPENROUTER_BASE_URL.to_string());
                (Some(url), Some(key), None)
            }
            ProviderKind::ClaudeCode => {
                let cli = merged
                    .cli_path
                    .unwrap_or_else(|| DEFAULT_CLI_PATH.to_string());
                (None, None, Some(cli))
            }
        };

        Ok(Self {
            provider,
            model,
            temperature: merged.temperature,
            system_prompt: merged
                .system_prompt
                .unwrap_or_else(|| prompts::DEFAULT_SYSTEM_PROMPT.to_string()),
            max_iterations,
            tools,
            base_url,
            api_key,
            cli_path,
        })
    }
}

// ── File sections ────────────────────────────────────────────────────────────

/// `[agent]` section: defaults shared by every worker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    pub max_iterations: Option<u32>,
    pub tools: Option<Vec<String>>,
}

/// How successful worker outputs are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    /// One synthesis call over all successful outputs.
    #[default]
    Consensus,
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub parallel_agents: usize,
    pub task_timeout_secs: u64,
    pub aggregation_strategy: AggregationStrategy,
    pub question_generation_prompt: String,
    pub synthesis_prompt: String,
    pub pool_capacity: usize,
    pub decomposition_attempts: u32,
    pub decomposition_backoff_ms: u64,
    /// Probe the synthesis backend before calling it.
    pub synthesis_preflight: bool,
    /// Overrides for the decomposition and synthesis workers.
    #[serde(flatten)]
    pub worker: WorkerOverrides,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            parallel_agents: DEFAULT_PARALLEL_AGENTS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            aggregation_strategy: AggregationStrategy::Consensus,
            question_generation_prompt: prompts::QUESTION_GENERATION_PROMPT.to_string(),
            synthesis_prompt: prompts::SYNTHESIS_PROMPT.to_string(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            decomposition_attempts: DEFAULT_DECOMPOSITION_ATTEMPTS,
            decomposition_backoff_ms: DEFAULT_DECOMPOSITION_BACKOFF_MS,
            synthesis_preflight: false,
            worker: WorkerOverrides::default(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct HeavyConfig {
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub agent: AgentSection,
    pub openrouter: Option<WorkerOverrides>,
    pub claude_code: Option<WorkerOverrides>,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub agents: BTreeMap<String, WorkerOverrides>,
}

static CONFIG_CACHE: OnceLock<Mutex<HashMap<PathBuf, HeavyConfig>>> = OnceLock::new();

fn config_cache() -> &'static Mutex<HashMap<PathBuf, HeavyConfig>> {
    CONFIG_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drop every cached config file (tests, hot reload).
pub fn clear_config_cache() {
    config_cache()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

impl HeavyConfig {
    /// Load, validate and cache a config file. Subsequent loads of the same
    /// canonical path return the cached copy until [`clear_config_cache`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HeavyError> {
        let key = std::fs::canonicalize(path.as_ref())?;

        if let Some(cached) = config_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            debug!(path = %key.display(), "config cache hit");
            return Ok(cached.clone());
        }

        let text = std::fs::read_to_string(&key)?;
        let config = Self::from_toml_str(&text)?;

        config_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, config.clone());
        Ok(config)
    }

    /// Parse and validate a TOML document. `OPENROUTER_API_KEY` fills in a
    /// missing `[openrouter] api_key`.
    pub fn from_toml_str(text: &str) -> Result<Self, HeavyError> {
        let mut config: Self = toml::from_str(text)?;
        if let Some(section) = config.openrouter.as_mut() {
            if section.api_key.is_none() {
                section.api_key = std::env::var(ENV_OPENROUTER_API_KEY).ok().map(ApiKey::new);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check structure and resolve every role that will be used.
    pub fn validate(&self) -> Result<(), HeavyError> {
        let provider = self
            .provider
            .ok_or_else(|| HeavyError::config("Missing required configuration field: provider"))?;
        if self.provider_section(provider).is_none() {
            return Err(HeavyError::config(format!(
                "Provider '{provider}' configuration not found"
            )));
        }

        let orch = &self.orchestrator;
        if orch.parallel_agents == 0 {
            return Err(HeavyError::config("parallel_agents must be >= 1"));
        }
        if orch.task_timeout_secs == 0 {
            return Err(HeavyError::config("task_timeout_secs must be > 0"));
        }
        if orch.decomposition_attempts == 0 {
            return Err(HeavyError::config("decomposition_attempts must be >= 1"));
        }

        for (key, overrides) in &self.agents {
            let index = parse_agent_id(key).ok_or_else(|| {
                HeavyError::config(format!("Agent key '{key}' must look like agent_<n>, n >= 1"))
            })?;
            if let Some(p) = overrides.provider {
                if self.provider_section(p).is_none() {
                    return Err(HeavyError::config(format!(
                        "Agent '{key}' references unknown provider '{p}'"
                    )));
                }
            }
            self.resolve(WorkerRole::Agent(index))?;
        }

        if let Some(p) = orch.worker.provider {
            if self.provider_section(p).is_none() {
                return Err(HeavyError::config(format!(
                    "Orchestrator references unknown provider '{p}'"
                )));
            }
        }
        self.resolve(WorkerRole::Orchestrator)?;
        for index in 0..orch.parallel_agents {
            self.resolve(WorkerRole::Agent(index))?;
        }
        Ok(())
    }

    /// Resolve the immutable worker config for a role.
    pub fn resolve(&self, role: WorkerRole) -> Result<WorkerConfig, HeavyError> {
        let top = self.role_overrides(role);
        let provider = top
            .and_then(|o| o.provider)
            .or(self.provider)
            .ok_or_else(|| HeavyError::config("Missing required configuration field: provider"))?;

        let merged = LAYER_PRECEDENCE
            .iter()
            .fold(WorkerOverrides::default(), |acc, layer| {
                acc.overlay(&self.layer(*layer, role, provider))
            });

        WorkerConfig::from_layers(provider, merged, role)
    }

    /// Resolve configs for slots `0..n`.
    pub fn resolve_slots(&self, n: usize) -> Result<Vec<WorkerConfig>, HeavyError> {
        (0..n).map(|i| self.resolve(WorkerRole::Agent(i))).collect()
    }

    fn layer(
        &self,
        layer: ConfigLayer,
        role: WorkerRole,
        provider: ProviderKind,
    ) -> WorkerOverrides {
        match layer {
            ConfigLayer::Defaults => WorkerOverrides {
                system_prompt: self.system_prompt.clone(),
                max_iterations: self.agent.max_iterations,
                tools: self.agent.tools.clone(),
                ..WorkerOverrides::default()
            },
            ConfigLayer::Provider => self.provider_section(provider).cloned().unwrap_or_default(),
            ConfigLayer::Agent => self.role_overrides(role).cloned().unwrap_or_default(),
        }
    }

    fn role_overrides(&self, role: WorkerRole) -> Option<&WorkerOverrides> {
        match role {
            WorkerRole::Agent(i) => self.agents.get(&agent_id(i)),
            WorkerRole::Orchestrator => Some(&self.orchestrator.worker),
        }
    }

    fn provider_section(&self, provider: ProviderKind) -> Option<&WorkerOverrides> {
        match provider {
            ProviderKind::OpenRouter => self.openrouter.as_ref(),
            ProviderKind::ClaudeCode => self.claude_code.as_ref(),
        }
    }

    pub fn num_agents(&self) -> usize {
        self.orchestrator.parallel_agents
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.task_timeout_secs)
    }

    pub fn decomposition_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.orchestrator.decomposition_attempts,
            Duration::from_millis(self.orchestrator.decomposition_backoff_ms),
        )
    }
}

/// `agent_3` → `Some(2)`.
fn parse_agent_id(key: &str) -> Option<usize> {
    key.strip_prefix("agent_")?
        .parse::<usize>()
        .ok()
        .filter(|n| *n >= 1)
        .map(|n| n - 1)
}
