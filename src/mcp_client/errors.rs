//! MCP client error types.
//!
//! Every variant that concerns a single backend carries the backend name so
//! the registry builder can turn it into a one-line skip reason, and the
//! dispatcher can tell callers which backend a failure came from.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while discovering, connecting to, or calling backends.
#[derive(Debug, Error)]
pub enum McpError {
    /// Configuration or runtime map is missing or malformed. Fatal at startup.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The backend could not be reached, or its stream dropped.
    #[error("backend '{backend}' unreachable: {reason}")]
    ConnectionFailed { backend: String, reason: String },

    /// The backend answered, but not with an MCP event stream.
    #[error("backend '{backend}' failed protocol verification: {reason}")]
    ProtocolMismatch { backend: String, reason: String },

    /// A bounded operation did not complete in time.
    #[error("{operation} on backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout {
        backend: String,
        operation: String,
        timeout_ms: u64,
    },

    /// No capability is registered under this qualified name.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// The backend reported a failure for a tool call.
    #[error("backend '{backend}' failed '{function}': {message}")]
    InvocationFailed {
        backend: String,
        function: String,
        code: Option<i32>,
        message: String,
    },

    /// A dispatched call failed after the capability was found.
    #[error("dispatch of '{tool}' to backend '{backend}' failed: {source}")]
    DispatchFailed {
        backend: String,
        tool: String,
        #[source]
        source: Box<McpError>,
    },

    /// A connection operation was attempted in the wrong lifecycle state.
    #[error("cannot {operation} backend '{backend}' while {state}")]
    IllegalState {
        backend: String,
        operation: String,
        state: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A backend process failed to start.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// Every backend failed and the build policy requires at least one.
    #[error("no live backends ({attempted} attempted)")]
    NoLiveBackends { attempted: usize },
}

impl McpError {
    /// The backend this error concerns, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            McpError::ConnectionFailed { backend, .. }
            | McpError::ProtocolMismatch { backend, .. }
            | McpError::Timeout { backend, .. }
            | McpError::InvocationFailed { backend, .. }
            | McpError::DispatchFailed { backend, .. }
            | McpError::IllegalState { backend, .. } => Some(backend),
            McpError::SpawnFailed { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Classify this error for a caller of the dispatcher.
    ///
    /// Wrapped dispatch errors are classified by their cause.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            McpError::UnknownTool { .. } => FailureKind::UnknownFunction,
            McpError::DispatchFailed { source, .. } => source.failure_kind(),
            McpError::Timeout { .. } => FailureKind::TimedOut,
            McpError::ConnectionFailed { .. }
            | McpError::IllegalState { .. }
            | McpError::SpawnFailed { .. }
            | McpError::NoLiveBackends { .. } => FailureKind::BackendUnreachable,
            _ => FailureKind::BackendError,
        }
    }
}

// ─── Structured failure ──────────────────────────────────────────────────────

/// Coarse category of a dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownFunction,
    BackendUnreachable,
    BackendError,
    TimedOut,
}

/// User-facing description of a failed call, safe to print or serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    pub kind: FailureKind,
    pub tool: String,
    pub backend: Option<String>,
    pub message: String,
}

impl DispatchFailure {
    /// Build a failure report for a call to `tool` that returned `error`.
    pub fn from_error(tool: &str, error: &McpError) -> Self {
        let message = match error {
            McpError::DispatchFailed { source, .. } => source.to_string(),
            other => other.to_string(),
        };
        Self {
            kind: error.failure_kind(),
            tool: tool.to_string(),
            backend: error.backend().map(str::to_string),
            message,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
