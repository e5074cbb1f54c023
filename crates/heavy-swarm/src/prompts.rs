//! Prompt templates for workers, decomposition and synthesis.
//!
//! Templates use `{placeholder}` markers filled by [`render`]. Config files may
//! replace the question and synthesis templates wholesale.

/// Prompt version. Bump on any template content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Default worker system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful research assistant. When a user asks a question, work through it \
carefully, use the tools available to you when they help, and give a complete, \
well-organised answer. When you have fully answered, call mark_task_complete with a \
short summary and your final message.";

/// Decomposition prompt. Placeholders: `{user_input}`, `{num_agents}`.
pub const QUESTION_GENERATION_PROMPT: &str = "\
You are an orchestrator that needs to create {num_agents} different questions to \
thoroughly analyze this topic from multiple angles.

Original user query: {user_input}

Generate exactly {num_agents} different, specific questions that will help gather \
comprehensive information about this topic. Each question should approach the topic \
from a different angle (research, analysis, verification, alternatives, etc.).

Return your response as a JSON array of strings, like this:
[\"question 1\", \"question 2\", \"question 3\", \"question 4\"]

Only return the JSON array, nothing else.";

/// Synthesis prompt. Placeholders: `{num_responses}`, `{agent_responses}`,
/// `{user_input}`.
pub const SYNTHESIS_PROMPT: &str = "\
You have {num_responses} different AI agents that analyzed the same query from \
different perspectives. Your job is to synthesize their responses into ONE \
comprehensive final answer.

Original query: {user_input}

Here are all the agent responses:

{agent_responses}

IMPORTANT: Just synthesize these into ONE final comprehensive answer that combines \
the best information from all agents. Do NOT call mark_task_complete or any other \
tools. Do NOT mention that you are synthesizing multiple responses. Simply provide \
the final synthesized answer directly as your response.";

/// Replace every `{key}` in `template` with its value.
///
/// Unknown placeholders are left in place; values are inserted verbatim and
/// never re-scanned, so braces inside user input are harmless.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let substituted = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close))
        });
        match substituted {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
