//! Route a call by qualified name to the backend that owns it.

use std::sync::Arc;
use std::time::Instant;

use super::errors::McpError;
use super::registry::Registry;
use super::types::ToolCallResult;

/// Read-only front end over a registry snapshot. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Call `qualified_name` with `arguments`.
    ///
    /// Fails with `UnknownTool` when the name is not registered, and with
    /// `DispatchFailed` (carrying the backend and the cause) when the backend
    /// call itself fails or times out. A `null` argument becomes `{}`.
    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let entry = self
            .registry
            .get(qualified_name)
            .ok_or_else(|| McpError::UnknownTool {
                name: qualified_name.to_string(),
            })?;

        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };

        let backend = &entry.descriptor.backend;
        let started = Instant::now();
        tracing::debug!(tool = qualified_name, backend = %backend, "dispatching");

        match entry
            .connection
            .invoke(&entry.descriptor.function, arguments)
            .await
        {
            Ok(result) => {
                let execution_time_ms = started.elapsed().as_millis() as u64;
                tracing::info!(tool = qualified_name, execution_time_ms, "tool call succeeded");
                Ok(ToolCallResult {
                    qualified_name: qualified_name.to_string(),
                    backend: backend.clone(),
                    content: result.content,
                    execution_time_ms,
                })
            }
            Err(e) => {
                tracing::warn!(tool = qualified_name, backend = %backend, error = %e, "tool call failed");
                Err(McpError::DispatchFailed {
                    backend: backend.clone(),
                    tool: qualified_name.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
