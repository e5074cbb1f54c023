//! Claude Code CLI worker.
//!
//! Each `run` spawns `claude -p <task> --output-format stream-json --verbose`
//! and folds the newline-delimited JSON events into one answer:
//!
//! ```text
//! {"type":"system","subtype":"init","model":...}
//! {"type":"assistant","message":{"content":[{"type":"text","text":...},{"type":"tool_use",...}]}}
//! {"type":"user",...}                       tool results, ignored
//! {"type":"result","subtype":"success","result":...,"total_cost_usd":...}
//! ```
//!
//! The child is spawned with `kill_on_drop`, so aborting the owning task
//! terminates the subprocess.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::Worker;
use crate::config::{WorkerConfig, MARK_COMPLETE_TOOL};
use crate::errors::WorkerError;

/// Timeout for the `--help` probe at construction.
pub const CLI_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

// ── Stream events ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    User,
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Accumulated state while reading one CLI run.
#[derive(Debug, Default)]
pub struct StreamTranscript {
    pub texts: Vec<String>,
    pub turns: u32,
    pub task_completed: bool,
    pub cost_usd: Option<f64>,
    pub error_subtype: Option<String>,
    pub malformed_lines: u32,
}

impl StreamTranscript {
    /// Feed one stdout line. Blank and non-JSON lines are counted and skipped.
    pub fn ingest(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                self.malformed_lines += 1;
                debug!(error = %e, "skipping malformed stream-json line");
                return;
            }
        };

        match event {
            StreamEvent::System { subtype, model } => {
                if subtype.as_deref() == Some("init") {
                    debug!(
                        model = model.as_deref().unwrap_or("default"),
                        "claude cli session started"
                    );
                }
            }
            StreamEvent::Assistant { message } => {
                self.turns += 1;
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } if !text.is_empty() => self.texts.push(text),
                        ContentBlock::ToolUse { name, input } => {
                            let command =
                                input.get("command").and_then(|c| c.as_str()).unwrap_or("");
                            if name == MARK_COMPLETE_TOOL
                                || (name == "Bash" && command.contains(MARK_COMPLETE_TOOL))
                            {
                                self.task_completed = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                total_cost_usd,
            } => {
                if subtype.as_deref() == Some("success") {
                    if let Some(text) = result.filter(|r| !r.is_empty()) {
                        if !self.texts.contains(&text) {
                            self.texts.push(text);
                        }
                    }
                }
                self.cost_usd = total_cost_usd.or(self.cost_usd);
                if is_error {
                    self.error_subtype = Some(subtype.unwrap_or_else(|| "unknown_error".into()));
                }
            }
            StreamEvent::User | StreamEvent::Other => {}
        }
    }

    pub fn answer(&self) -> String {
        self.texts.join("\n\n")
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Worker that shells out to the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliWorker {
    program: String,
    prefix_args: Vec<String>,
    model: String,
    system_prompt: String,
    max_turns: u32,
    allowed_tools: Vec<String>,
}

impl ClaudeCliWorker {
    /// Build and verify the CLI is installed.
    pub async fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let worker = Self::unverified(config)?;
        verify_cli(&worker.program, &worker.prefix_args).await?;
        Ok(worker)
    }

    /// Build without touching the filesystem.
    pub fn unverified(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let (program, prefix_args) = Self::command_line(config)?;
        Ok(Self {
            program,
            prefix_args,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_turns: config.max_iterations,
            allowed_tools: config.tools.iter().cloned().collect(),
        })
    }

    /// Split `cli_path` (`"npx claude"`) into program and leading arguments.
    pub fn command_line(config: &WorkerConfig) -> Result<(String, Vec<String>), WorkerError> {
        let raw = config.cli_path.as_deref().unwrap_or(crate::config::DEFAULT_CLI_PATH);
        let mut parts = shlex::split(raw)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| WorkerError::Unavailable(format!("invalid cli_path '{raw}'")))?;
        let program = parts.remove(0);
        Ok((program, parts))
    }

    /// Arguments passed after the program name for one task.
    pub fn args_for(&self, task: &str) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend([
            "-p".to_string(),
            task.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--system-prompt".to_string(),
            self.system_prompt.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--model".to_string(),
            self.model.clone(),
        ]);
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        args
    }
}

#[async_trait]
impl Worker for ClaudeCliWorker {
    async fn run(&mut self, task: &str) -> Result<String, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(self.args_for(task))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Process(format!("failed to spawn '{}': {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Process("child stdout not captured".into()))?;
        // Drained concurrently so a chatty stderr cannot block the child.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut err) = stderr {
                let _ = err.read_to_string(&mut text).await;
            }
            text
        });

        let mut transcript = StreamTranscript::default();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| WorkerError::Process(format!("reading cli output: {e}")))?
        {
            transcript.ingest(&line);
        }

        let stderr_text = stderr_task.await.unwrap_or_default();
        let status = child
            .wait()
            .await
            .map_err(|e| WorkerError::Process(format!("waiting for cli: {e}")))?;

        info!(
            turns = transcript.turns,
            max_turns = self.max_turns,
            completed = transcript.task_completed,
            cost_usd = transcript.cost_usd.unwrap_or(0.0),
            "claude cli run finished"
        );
        if let Some(subtype) = &transcript.error_subtype {
            warn!(subtype = %subtype, "claude cli reported an error result");
        }

        let answer = transcript.answer();
        if answer.is_empty() && !status.success() {
            return Err(WorkerError::Process(format!(
                "claude cli exited with {status}: {}",
                stderr_text.trim()
            )));
        }
        if answer.is_empty() {
            if let Some(subtype) = transcript.error_subtype {
                return Err(WorkerError::Inference(format!("claude cli error: {subtype}")));
            }
        }
        Ok(answer)
    }
}

/// Run `<program> --help` to confirm the CLI is installed.
pub async fn verify_cli(program: &str, prefix_args: &[String]) -> Result<(), WorkerError> {
    let mut command = Command::new(program);
    command
        .args(prefix_args)
        .arg("--help")
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(CLI_VERIFICATION_TIMEOUT, command.output()).await {
        Err(_) => Err(WorkerError::Unavailable("Claude CLI verification timed out".into())),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkerError::Unavailable(
            format!(
                "Claude CLI not found at '{program}'. \
                 Please install with: npm install -g @anthropic-ai/claude-code"
            ),
        )),
        Ok(Err(e)) => Err(WorkerError::Unavailable(format!(
            "Failed to verify Claude CLI: {e}"
        ))),
        Ok(Ok(output)) if !output.status.success() => Err(WorkerError::Unavailable(format!(
            "Claude CLI returned error: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Ok(Ok(_)) => Ok(()),
    }
}
