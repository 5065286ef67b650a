//! Startup report: which backends came up and why the others did not.

use std::fmt;

use serde::Serialize;

use super::errors::McpError;

/// Why a backend was left out of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Configured, but absent from the runtime map.
    NotInRuntimeMap,
    /// Present in the runtime map, but not configured.
    NotConfigured,
    Unreachable(String),
    ProtocolMismatch(String),
    TimedOut(String),
    SpawnFailed(String),
    Failed(String),
}

impl SkipReason {
    pub fn from_error(error: &McpError) -> Self {
        match error {
            McpError::ConnectionFailed { reason, .. } => Self::Unreachable(reason.clone()),
            McpError::ProtocolMismatch { reason, .. } => Self::ProtocolMismatch(reason.clone()),
            McpError::Timeout {
                operation,
                timeout_ms,
                ..
            } => Self::TimedOut(format!("{operation} after {timeout_ms}ms")),
            McpError::SpawnFailed { reason, .. } => Self::SpawnFailed(reason.clone()),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInRuntimeMap => f.write_str("not in runtime map"),
            Self::NotConfigured => f.write_str("not in configuration"),
            Self::Unreachable(r) => write!(f, "unreachable: {r}"),
            Self::ProtocolMismatch(r) => write!(f, "protocol mismatch: {r}"),
            Self::TimedOut(r) => write!(f, "timed out: {r}"),
            Self::SpawnFailed(r) => write!(f, "failed to launch: {r}"),
            Self::Failed(r) => write!(f, "failed: {r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveBackend {
    pub name: String,
    pub capability_count: usize,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBackend {
    pub name: String,
    pub reason: SkipReason,
}

/// Outcome of one bootstrap cycle, in connection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub live: Vec<LiveBackend>,
    pub skipped: Vec<SkippedBackend>,
}

impl BootstrapReport {
    pub fn skip(&mut self, name: &str, reason: SkipReason) {
        self.skipped.push(SkippedBackend {
            name: name.to_string(),
            reason,
        });
    }

    /// Fold in skips recorded by an earlier phase.
    pub fn extend_skipped(&mut self, skipped: impl IntoIterator<Item = SkippedBackend>) {
        self.skipped.extend(skipped);
    }

    pub fn skip_reason(&self, name: &str) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.reason)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.iter().any(|b| b.name == name)
    }
}

impl fmt::Display for BootstrapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for backend in &self.live {
            let plural = if backend.capability_count == 1 { "y" } else { "ies" };
            write!(
                f,
                "+ {} ({} capabilit{plural})",
                backend.name, backend.capability_count
            )?;
            if let Some(server) = &backend.server_name {
                write!(f, " [{server}]")?;
            }
            writeln!(f)?;
        }
        for skipped in &self.skipped {
            writeln!(f, "- {}: {}", skipped.name, skipped.reason)?;
        }
        Ok(())
    }
}
