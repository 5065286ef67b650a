//! The agent-runner seam and the tool surface handed to it.
//!
//! The language model itself lives behind [`AgentRunner`]: given an agent,
//! an input and the tools that agent may use, produce a final output and a
//! trace of steps. Sessions only sequence runners; they never talk to a
//! model directly.

use async_trait::async_trait;

use super::errors::SessionError;
use super::types::{AgentRun, AgentSpec, StepTrace, ToolSelection};
use crate::mcp_client::dispatcher::Dispatcher;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::function_spec;
use crate::mcp_client::types::{CapabilityDescriptor, ToolCallResult};

/// Runs one agent to completion.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        agent: &AgentSpec,
        input: &str,
        tools: &ToolSurface,
    ) -> Result<AgentRun, SessionError>;
}

// ─── Tool surface ────────────────────────────────────────────────────────────

/// The capabilities one agent may see and call.
#[derive(Clone)]
pub struct ToolSurface {
    dispatcher: Dispatcher,
    visible: Vec<CapabilityDescriptor>,
}

impl ToolSurface {
    /// Capabilities from the dispatcher's registry that `selection` allows.
    pub fn for_selection(dispatcher: &Dispatcher, selection: &ToolSelection) -> Self {
        let visible = dispatcher
            .registry()
            .descriptors()
            .filter(|d| selection.allows(d))
            .cloned()
            .collect();
        Self {
            dispatcher: dispatcher.clone(),
            visible,
        }
    }

    pub fn descriptors(&self) -> &[CapabilityDescriptor] {
        &self.visible
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.visible.iter().any(|d| d.qualified_name == qualified_name)
    }

    /// OpenAI-style function specs for the visible capabilities.
    pub fn function_specs(&self) -> Vec<serde_json::Value> {
        self.visible.iter().map(function_spec).collect()
    }

    /// Call a visible capability. Anything outside the surface is unknown.
    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        if !self.contains(qualified_name) {
            return Err(McpError::UnknownTool {
                name: qualified_name.to_string(),
            });
        }
        self.dispatcher.call(qualified_name, arguments).await
    }
}

// ─── Direct-call runner ──────────────────────────────────────────────────────

/// Runner without a model: reads its input as `<qualified_name> [json-args]`
/// and makes exactly that call. The output is the result's text.
///
/// Non-empty instructions are the call line instead, with `{input}` replaced
/// by the input as a JSON value (kept as-is when it already parses, quoted
/// otherwise). That lets configured pipeline stages feed each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectCallRunner;

#[async_trait]
impl AgentRunner for DirectCallRunner {
    async fn run(
        &self,
        agent: &AgentSpec,
        input: &str,
        tools: &ToolSurface,
    ) -> Result<AgentRun, SessionError> {
        let line = call_line(&agent.instructions, input);
        let line = line.trim();
        let (name, raw_args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        if name.is_empty() {
            return Err(SessionError::Agent {
                agent: agent.name.clone(),
                reason: "no tool named in input".into(),
            });
        }
        let arguments = if raw_args.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(raw_args).map_err(|e| SessionError::Agent {
                agent: agent.name.clone(),
                reason: format!("arguments are not valid JSON: {e}"),
            })?
        };

        let result = tools.call(name, arguments).await?;
        let text = result.text();
        let final_output = if text.is_empty() {
            serde_json::Value::Array(result.content.clone()).to_string()
        } else {
            text
        };
        Ok(AgentRun {
            final_output,
            steps: vec![StepTrace {
                label: name.to_string(),
                detail: format!("{}ms on {}", result.execution_time_ms, result.backend),
            }],
        })
    }
}

fn call_line(template: &str, input: &str) -> String {
    let input = input.trim();
    if template.trim().is_empty() {
        return input.to_string();
    }
    let value = match serde_json::from_str::<serde_json::Value>(input) {
        Ok(_) => input.to_string(),
        Err(_) => serde_json::Value::String(input.to_string()).to_string(),
    };
    template.replace("{input}", &value)
}
