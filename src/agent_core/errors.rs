//! Agent session error types.

use thiserror::Error;

use crate::mcp_client::errors::McpError;

/// Errors that can end an agent session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session ran past its overall deadline. Connections are untouched.
    #[error("session exceeded its {deadline_ms}ms deadline")]
    Timeout { deadline_ms: u64 },

    /// An agent could not produce an output.
    #[error("agent '{agent}' failed: {reason}")]
    Agent { agent: String, reason: String },

    /// The pipeline definition is unusable.
    #[error("invalid pipeline: {reason}")]
    InvalidTopology { reason: String },

    /// Conditional handoffs kept bouncing between stages.
    #[error("pipeline exceeded {limit} stage transitions")]
    HandoffLimit { limit: usize },

    /// A tool call made by an agent failed.
    #[error(transparent)]
    Tool(#[from] McpError),
}

impl SessionError {
    /// The underlying tool error, if this is one.
    pub fn tool_error(&self) -> Option<&McpError> {
        match self {
            SessionError::Tool(e) => Some(e),
            _ => None,
        }
    }
}
