//! Task decomposition: one user task → exactly N subtasks.
//!
//! The decomposition worker is asked for a JSON array of N strings. Parse
//! errors, length mismatches, empty entries and transient worker errors count
//! as a failed attempt and are retried under a [`RetryPolicy`]. A permanent
//! worker error (no CLI, no credentials) skips the remaining attempts. Either
//! way the fallback is a keyword-classified template set; that path makes no
//! external calls and always yields N items.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{WorkerConfig, MARK_COMPLETE_TOOL};
use crate::errors::{HeavyError, WorkerError};
use crate::pool::WorkerPool;
use crate::prompts::{self, QUESTION_GENERATION_PROMPT};
use crate::retry::{retry_if, RetryPolicy};

/// Shallow task classification driving the fallback templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Technical,
    Research,
    ProblemSolving,
    Analysis,
    General,
}

/// Keyword sets, checked in this order. First match wins.
const CATEGORY_KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::Technical,
        &[
            "code", "program", "programming", "software", "algorithm", "api", "database",
            "debug", "function", "implement", "rust", "python", "javascript", "compile",
        ],
    ),
    (
        TaskCategory::Research,
        &[
            "research", "history", "study", "studies", "evidence", "sources", "literature",
            "who", "when", "origin",
        ],
    ),
    (
        TaskCategory::ProblemSolving,
        &[
            "solve", "fix", "problem", "issue", "improve", "optimize", "troubleshoot", "how can",
            "how do",
        ],
    ),
    (
        TaskCategory::Analysis,
        &[
            "analyze", "analyse", "analysis", "compare", "comparison", "evaluate", "pros",
            "cons", "impact", "trend", "versus", "vs",
        ],
    ),
];

fn category_patterns() -> &'static [(TaskCategory, Regex)] {
    static PATTERNS: OnceLock<Vec<(TaskCategory, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CATEGORY_KEYWORDS
            .iter()
            .filter_map(|(category, words)| {
                let alternation = words
                    .iter()
                    .map(|w| regex::escape(w))
                    .collect::<Vec<_>>()
                    .join("|");
                Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))
                    .ok()
                    .map(|re| (*category, re))
            })
            .collect()
    })
}

/// Keyword classification with word boundaries.
pub fn classify_task(task: &str) -> TaskCategory {
    category_patterns()
        .iter()
        .find(|(_, re)| re.is_match(task))
        .map(|(category, _)| *category)
        .unwrap_or(TaskCategory::General)
}

fn templates(category: TaskCategory) -> &'static [&'static str] {
    match category {
        TaskCategory::Technical => &[
            "Explain the core technical concepts behind: {task}",
            "Propose a concrete implementation approach for: {task}",
            "Identify edge cases, failure modes and pitfalls in: {task}",
            "Review best practices and alternative designs for: {task}",
        ],
        TaskCategory::Research => &[
            "Research comprehensive background information about: {task}",
            "Find primary sources and key evidence on: {task}",
            "Summarize the historical context and development of: {task}",
            "Verify and cross-check the main claims about: {task}",
        ],
        TaskCategory::ProblemSolving => &[
            "Identify the root causes of: {task}",
            "Propose step-by-step solutions for: {task}",
            "Evaluate the trade-offs of alternative solutions to: {task}",
            "Describe how to verify that a solution works for: {task}",
        ],
        TaskCategory::Analysis => &[
            "Analyze the key factors involved in: {task}",
            "Compare the main options or positions on: {task}",
            "Assess the strengths and weaknesses relevant to: {task}",
            "Evaluate the likely impact and implications of: {task}",
        ],
        TaskCategory::General => &[
            "Research comprehensive information about: {task}",
            "Analyze and provide insights about: {task}",
            "Find alternative perspectives on: {task}",
            "Verify and cross-check facts about: {task}",
        ],
    }
}

/// Deterministic template subtasks, exactly `n` of them.
///
/// Templates beyond the base list cycle with an angle suffix so every
/// subtask stays distinct.
pub fn fallback_subtasks(task: &str, n: usize) -> Vec<String> {
    let base = templates(classify_task(task));
    (0..n)
        .map(|i| {
            let text = prompts::render(base[i % base.len()], &[("task", task)]);
            match i / base.len() {
                0 => text,
                round => format!("{text} (additional angle {round})"),
            }
        })
        .collect()
}

/// Slice from the first `[` to the last `]`, after stripping markdown fences.
pub fn extract_json_array(raw: &str) -> &str {
    let stripped = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    match (stripped.find('['), stripped.rfind(']')) {
        (Some(start), Some(end)) if start < end => &stripped[start..=end],
        _ => stripped,
    }
}

/// Strictly parse exactly `n` non-empty subtasks.
pub fn parse_subtasks(raw: &str, n: usize) -> Result<Vec<String>, HeavyError> {
    let subtasks: Vec<String> = serde_json::from_str(extract_json_array(raw)).map_err(|e| {
        HeavyError::Decomposition(format!("response is not a JSON string array: {e}"))
    })?;
    if subtasks.len() != n {
        return Err(HeavyError::Decomposition(format!(
            "expected {n} questions, got {}",
            subtasks.len()
        )));
    }
    if let Some(pos) = subtasks.iter().position(|s| s.trim().is_empty()) {
        return Err(HeavyError::Decomposition(format!("question {} is empty", pos + 1)));
    }
    Ok(subtasks)
}

/// Turns one task into N subtasks with a pooled worker.
pub struct Decomposer {
    pool: Arc<WorkerPool>,
    config: WorkerConfig,
    template: String,
    retry: RetryPolicy,
}

impl Decomposer {
    /// `config` is the orchestrator role; the completion tool is stripped so
    /// the worker answers directly.
    pub fn new(pool: Arc<WorkerPool>, config: WorkerConfig) -> Self {
        Self {
            pool,
            config: config.without_tool(MARK_COMPLETE_TOOL),
            template: QUESTION_GENERATION_PROMPT.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Always returns exactly `n` subtasks.
    pub async fn decompose(&self, task: &str, n: usize) -> Vec<String> {
        if n == 0 {
            return Vec::new();
        }
        let num_agents = n.to_string();
        let prompt = prompts::render(
            &self.template,
            &[("user_input", task), ("num_agents", &num_agents)],
        );

        let prompt = prompt.as_str();
        let started = std::time::Instant::now();
        let outcome = retry_if(
            &self.retry,
            "decompose",
            WorkerError::is_transient,
            move |attempt| async move {
                debug!(attempt, n, "requesting subtasks");
                self.attempt(prompt, n).await
            },
        )
        .await;

        match outcome {
            Ok(subtasks) => {
                info!(
                    n,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generated subtasks"
                );
                subtasks
            }
            Err(source) => {
                let category = classify_task(task);
                let err = HeavyError::Decomposition(source.to_string());
                warn!(
                    error = %err,
                    retry_category = %source.retry_category(),
                    ?category,
                    "decomposition failed, using template subtasks"
                );
                fallback_subtasks(task, n)
            }
        }
    }

    /// Worker errors pass through with their category; an unusable answer
    /// becomes `WorkerError::Parse`, which is retried.
    async fn attempt(&self, prompt: &str, n: usize) -> Result<Vec<String>, WorkerError> {
        let mut checkout = self.pool.acquire(&self.config).await?;
        let response = checkout.run(prompt).await;
        self.pool.release(checkout).await;

        parse_subtasks(&response?, n).map_err(|e| WorkerError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::errors::WorkerError;
    use crate::worker::{MockWorker, MockWorkerFactory, Worker};
    use std::time::Duration;

    fn decomposer(responses: Vec<Result<String, WorkerError>>) -> Decomposer {
        let responses = std::sync::Mutex::new(responses.into_iter());
        let mut factory = MockWorkerFactory::new();
        factory.expect_build().returning(move |config| {
            assert!(!config.tools.contains(MARK_COMPLETE_TOOL));
            let next = responses
                .lock()
                .unwrap()
                .next()
                .unwrap_or_else(|| Err(WorkerError::Inference("exhausted".into())));
            let mut w = MockWorker::new();
            w.expect_run().return_once(move |_| next);
            w.expect_reset().returning(|| Ok(()));
            Ok(Box::new(w) as Box<dyn Worker>)
        });
        // Capacity 0 forces one fresh mock per attempt.
        let pool = Arc::new(WorkerPool::new(Arc::new(factory), 0));
        Decomposer::new(pool, WorkerConfig::new(ProviderKind::ClaudeCode, "orch"))
            .with_retry(RetryPolicy::exponential(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn returns_parsed_subtasks_exactly() {
        let d = decomposer(vec![Ok(r#"["a","b","c"]"#.to_string())]);
        assert_eq!(d.decompose("anything", 3).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn retries_after_length_mismatch() {
        let d = decomposer(vec![
            Ok(r#"["only one"]"#.to_string()),
            Ok("```json\n[\"x\", \"y\"]\n```".to_string()),
        ]);
        assert_eq!(d.decompose("anything", 2).await, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn malformed_json_everywhere_falls_back() {
        let d = decomposer(vec![
            Ok("not json".to_string()),
            Ok("[1, 2, 3]".to_string()),
            Err(WorkerError::Inference("502".into())),
        ]);
        let subtasks = d.decompose("tell me about bees", 3).await;
        assert_eq!(subtasks.len(), 3);
        assert!(subtasks.iter().all(|s| s.contains("tell me about bees")));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_worker_error_skips_straight_to_templates() {
        let mut factory = MockWorkerFactory::new();
        factory
            .expect_build()
            .times(1)
            .returning(|_| Err(WorkerError::Unavailable("claude not found".into())));
        let pool = Arc::new(WorkerPool::new(Arc::new(factory), 0));
        let d = Decomposer::new(pool, WorkerConfig::new(ProviderKind::ClaudeCode, "orch"));

        let started = tokio::time::Instant::now();
        let subtasks = d.decompose("tell me about bees", 3).await;
        assert_eq!(subtasks, fallback_subtasks("tell me about bees", 3));
        // Default policy would have slept 1s + 2s.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_subtasks_needs_no_worker() {
        let factory = MockWorkerFactory::new();
        let pool = Arc::new(WorkerPool::new(Arc::new(factory), 1));
        let d = Decomposer::new(pool, WorkerConfig::new(ProviderKind::ClaudeCode, "orch"));
        assert!(d.decompose("x", 0).await.is_empty());
    }

    #[test]
    fn classification_order_and_boundaries() {
        assert_eq!(classify_task("Debug this Rust function"), TaskCategory::Technical);
        assert_eq!(classify_task("history of the printing press"), TaskCategory::Research);
        assert_eq!(classify_task("How can I fix my sleep schedule"), TaskCategory::ProblemSolving);
        assert_eq!(classify_task("compare tea and coffee"), TaskCategory::Analysis);
        // "apiary" must not match "api".
        assert_eq!(classify_task("keeping an apiary"), TaskCategory::General);
    }

    #[test]
    fn fallback_pads_and_truncates() {
        assert_eq!(fallback_subtasks("bees", 2).len(), 2);
        let many = fallback_subtasks("bees", 6);
        assert_eq!(many.len(), 6);
        assert!(many[4].ends_with("(additional angle 1)"));
        let unique: std::collections::HashSet<_> = many.iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn parse_rejects_empty_entries() {
        assert!(parse_subtasks(r#"["a", "  "]"#, 2).is_err());
        assert!(parse_subtasks(r#"Sure! ["a", "b"] hope that helps"#, 2).is_ok());
    }
}
