//! Shared types for agent sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mcp_client::types::CapabilityDescriptor;

// ─── Agents ──────────────────────────────────────────────────────────────────

/// Which capabilities an agent may see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolSelection {
    #[default]
    All,
    /// Backend names (`calc`) or qualified names (`calc.add`).
    Only(Vec<String>),
}

impl ToolSelection {
    pub fn allows(&self, descriptor: &CapabilityDescriptor) -> bool {
        match self {
            ToolSelection::All => true,
            ToolSelection::Only(names) => names
                .iter()
                .any(|n| *n == descriptor.backend || *n == descriptor.qualified_name),
        }
    }
}

/// A named agent: its instructions and the tools it may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub instructions: String,
    pub tools: ToolSelection,
}

impl AgentSpec {
    /// An agent that can see every registered capability.
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            tools: ToolSelection::All,
        }
    }

    /// Restrict the agent to the named backends or capabilities.
    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = ToolSelection::Only(names.into_iter().map(Into::into).collect());
        self
    }
}

// ─── Traces ──────────────────────────────────────────────────────────────────

/// One step an agent reports having taken (a tool call, a thought).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepTrace {
    pub label: String,
    pub detail: String,
}

/// What an agent run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRun {
    pub final_output: String,
    pub steps: Vec<StepTrace>,
}

/// Record of one stage finishing and handing off.
#[derive(Debug, Clone, Serialize)]
pub struct StageTransition {
    pub stage: String,
    pub input_summary: String,
    pub output_summary: String,
    /// `None` when this stage produced the session result.
    pub next_stage: Option<String>,
    pub steps: Vec<StepTrace>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Result of a whole session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub output: String,
    pub transitions: Vec<StageTransition>,
}

impl SessionOutcome {
    /// Stage names in the order they ran.
    pub fn stage_path(&self) -> Vec<&str> {
        self.transitions.iter().map(|t| t.stage.as_str()).collect()
    }
}

// ─── Summaries ───────────────────────────────────────────────────────────────

/// Maximum bytes kept in a transition summary.
pub const SUMMARY_MAX_BYTES: usize = 120;

/// Single-line, length-bounded version of `text` for logs.
pub fn summarize(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= SUMMARY_MAX_BYTES {
        return flat;
    }
    format!("{}…", truncate_utf8(&flat, SUMMARY_MAX_BYTES))
}

/// Truncate to at most `max_bytes` bytes on a char boundary.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(backend: &str, function: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            qualified_name: format!("{backend}.{function}"),
            backend: backend.into(),
            function: function.into(),
            description: String::new(),
            parameters: serde_json::json!({}),
        }
    }

    #[test]
    fn test_selection_by_backend_or_qualified_name() {
        let only = ToolSelection::Only(vec!["search".into(), "calc.add".into()]);
        assert!(only.allows(&descriptor("search", "query")));
        assert!(only.allows(&descriptor("calc", "add")));
        assert!(!only.allows(&descriptor("calc", "sub")));
        assert!(ToolSelection::All.allows(&descriptor("calc", "sub")));
    }

    #[test]
    fn test_summarize_flattens_and_bounds() {
        assert_eq!(summarize("two\nlines  here"), "two lines here");
        let long = "é".repeat(100);
        let s = summarize(&long);
        assert!(s.ends_with('…'));
        assert!(s.len() <= SUMMARY_MAX_BYTES + '…'.len_utf8());
    }
}
