//! Discovery & bootstrap: match configured backends against live endpoints.
//!
//! The runtime map (`mcp-runtime.json`) records where each launched backend
//! listens, as `name → base address`. It is written by the supervisor and
//! read back here. Iteration order of the map is the connection order for
//! the whole system, and teardown runs in its reverse.

use std::path::Path;

use indexmap::IndexMap;

use super::errors::McpError;
use super::report::{SkipReason, SkippedBackend};
use super::types::RuntimeEndpoint;
use crate::config::ToolplaneConfig;

/// Backend name → base address, in file order.
pub type RuntimeMap = IndexMap<String, String>;

/// Read a runtime map. Missing or malformed files are a `ConfigError`.
pub fn load_runtime_map(path: &Path) -> Result<RuntimeMap, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read runtime map {}: {e}", path.display()),
    })?;
    serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse runtime map {}: {e}", path.display()),
    })
}

/// Write a runtime map as pretty-printed JSON, creating parent directories.
pub fn write_runtime_map(path: &Path, map: &RuntimeMap) -> Result<(), McpError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| McpError::ConfigError {
            reason: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    let json = serde_json::to_string_pretty(map).map_err(|e| McpError::ConfigError {
        reason: format!("failed to serialize runtime map: {e}"),
    })?;
    std::fs::write(path, json + "\n").map_err(|e| McpError::ConfigError {
        reason: format!("failed to write runtime map {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), backends = map.len(), "runtime map written");
    Ok(())
}

/// Endpoints that can be connected to, plus the names that were left out.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub endpoints: Vec<RuntimeEndpoint>,
    pub skipped: Vec<SkippedBackend>,
}

/// Keep runtime entries that have a configured backend, in runtime order.
///
/// Unknown runtime names and configured backends with no runtime entry are
/// skipped with a warning. Neither is fatal.
pub fn resolve(config: &ToolplaneConfig, runtime: &RuntimeMap) -> Resolution {
    let mut resolution = Resolution::default();

    for (name, base_url) in runtime {
        if config.backend(name).is_none() {
            tracing::warn!(backend = %name, "runtime entry has no configuration, skipping");
            resolution.skipped.push(SkippedBackend {
                name: name.clone(),
                reason: SkipReason::NotConfigured,
            });
            continue;
        }
        resolution
            .endpoints
            .push(RuntimeEndpoint::new(name.clone(), base_url.clone()));
    }

    for name in config.servers.keys() {
        if !runtime.contains_key(name) {
            tracing::warn!(backend = %name, "configured backend not in runtime map, skipping");
            resolution.skipped.push(SkippedBackend {
                name: name.clone(),
                reason: SkipReason::NotInRuntimeMap,
            });
        }
    }

    resolution
}

// ─── Tests ───────────────────────────────────────────────────────────────────
