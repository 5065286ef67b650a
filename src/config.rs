//! Control-plane configuration loading and validation.
//!
//! Reads a `mcp.json` (or `.yaml`) file describing the backends, the
//! control-plane settings and, optionally, the agents a session runs. `${VAR}` and `${VAR:-default}` references are
//! resolved from the environment before parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::mcp_client::connection::ConnectionTimeouts;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::BuildPolicy;

// ─── Public Types ────────────────────────────────────────────────────────────

/// How a backend exposes its event stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Speaks MCP over stdio; launched behind the stdio→SSE gateway.
    Stdio,
    /// Binds its own port and serves SSE directly.
    #[default]
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
        }
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendSpec {
    /// Key in the `servers` map; filled in after parsing.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    /// Absent for externally managed backends.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Names of environment variables the backend needs.
    #[serde(rename = "env", default, deserialize_with = "env_names")]
    pub required_env: Vec<String>,
    /// Working directory, relative to the config file's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Fixed port; otherwise one is allocated from `settings.base_port`.
    #[serde(default)]
    pub port: Option<u16>,
}

impl BackendSpec {
    /// Whether the supervisor should launch this backend.
    pub fn is_launchable(&self) -> bool {
        self.command.is_some()
    }

    /// Working directory resolved against `base_dir`.
    pub fn resolved_cwd(&self, base_dir: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) => {
                let expanded = PathBuf::from(expand_tilde(&cwd.to_string_lossy()));
                if expanded.is_absolute() {
                    expanded
                } else {
                    base_dir.join(expanded)
                }
            }
            None => base_dir.to_path_buf(),
        }
    }

    /// Required variables missing from the current environment.
    pub fn missing_env(&self) -> Vec<&str> {
        self.required_env
            .iter()
            .filter(|var| std::env::var_os(var.as_str()).is_none())
            .map(String::as_str)
            .collect()
    }
}

/// `env` may be a list of names or a map whose keys are the names.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnvDecl {
    Names(Vec<String>),
    Map(IndexMap<String, serde_json::Value>),
}

fn env_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<EnvDecl>::deserialize(deserializer)? {
        Some(EnvDecl::Names(names)) => names,
        Some(EnvDecl::Map(map)) => map.into_keys().collect(),
        None => Vec::new(),
    })
}

/// Control-plane tunables. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControlPlaneSettings {
    /// Event-stream path appended to each base address.
    pub sse_path: String,
    /// Message path the gateway serves for wrapped backends.
    pub message_path: String,
    pub connect_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub call_timeout_secs: u64,
    /// Fail the bootstrap when no backend comes up.
    pub require_live_backend: bool,
    pub base_port: u16,
    /// Address written to the runtime map; `{port}` is substituted.
    pub advertise_url: String,
    /// Command line of the stdio→SSE gateway.
    pub gateway: String,
    pub startup_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            sse_path: "/sse".into(),
            message_path: "/message".into(),
            connect_timeout_secs: 10,
            verify_timeout_secs: 30,
            list_timeout_secs: 30,
            call_timeout_secs: 60,
            require_live_backend: false,
            base_port: 8000,
            advertise_url: "http://localhost:{port}".into(),
            gateway: "npx -y supergateway".into(),
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

impl ControlPlaneSettings {
    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            verify: Duration::from_secs(self.verify_timeout_secs),
            list: Duration::from_secs(self.list_timeout_secs),
            call: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn build_policy(&self) -> BuildPolicy {
        BuildPolicy {
            require_live_backend: self.require_live_backend,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Base address advertised for a backend listening on `port`.
    pub fn advertised_url(&self, port: u16) -> String {
        self.advertise_url.replace("{port}", &port.to_string())
    }

    /// Gateway program and its leading arguments.
    pub fn gateway_command(&self) -> Result<(String, Vec<String>), McpError> {
        let mut parts = self.gateway.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| McpError::ConfigError {
            reason: "settings.gateway is empty".into(),
        })?;
        Ok((program, parts.collect()))
    }
}

/// One session agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    /// Backend or qualified names; absent means every capability.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub handoff: HandoffConfig,
}

/// Where an agent's output goes: `"next"`, `"terminal"`, `{"to": name}` or
/// `{"route": {"rules": [{"when": text, "to": name}], "otherwise": name}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffConfig {
    #[default]
    Next,
    Terminal,
    To(String),
    Route {
        rules: Vec<RouteRule>,
        #[serde(default)]
        otherwise: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    /// Case-insensitive substring of the agent's output.
    pub when: String,
    pub to: String,
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolplaneConfig {
    /// Backends in declaration order.
    pub servers: IndexMap<String, BackendSpec>,
    #[serde(default)]
    pub settings: ControlPlaneSettings,
    /// Session agents in stage order. None means one agent with every tool;
    /// two or more form a pipeline.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Directory relative `cwd` entries resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl ToolplaneConfig {
    pub fn backend(&self, name: &str) -> Option<&BackendSpec> {
        self.servers.get(name)
    }

    pub fn backends(&self) -> impl Iterator<Item = &BackendSpec> {
        self.servers.values()
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load, interpolate, parse and validate a configuration file.
///
/// A missing, unreadable or malformed file is a `ConfigError`.
pub fn load_config(path: &Path) -> Result<ToolplaneConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    parse_config(&raw, is_json(path), base_dir)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Parse configuration text. `base_dir` anchors relative working directories.
pub fn parse_config(
    raw: &str,
    json: bool,
    base_dir: PathBuf,
) -> Result<ToolplaneConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    let mut config: ToolplaneConfig = if json {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?
    };

    if config.servers.is_empty() {
        return Err(McpError::ConfigError {
            reason: "no servers configured".into(),
        });
    }
    for (name, spec) in config.servers.iter_mut() {
        validate_name(name)?;
        spec.name = name.clone();
    }
    config.base_dir = base_dir;
    Ok(config)
}

/// Backend names become the prefix of qualified names, so no dots.
fn validate_name(name: &str) -> Result<(), McpError> {
    if name.is_empty() || name.contains('.') || name.chars().any(char::is_whitespace) {
        return Err(McpError::ConfigError {
            reason: format!("invalid server name '{name}': no dots or spaces allowed"),
        });
    }
    Ok(())
}

/// Replace `${VAR}` and `${VAR:-default}` with values from the environment.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "servers": {
            "calc": {
                "type": "stdio",
                "command": "python",
                "args": ["calc.py"],
                "env": ["CALC_TOKEN"],
                "cwd": "servers/calc"
            },
            "search": { "command": "python", "args": ["search.py"], "port": 9100 },
            "remote": { "type": "sse" }
        },
        "settings": { "call_timeout_secs": 5, "require_live_backend": true }
    }"#;

    #[test]
    fn test_parse_preserves_order_and_defaults() {
        let cfg = parse_config(SAMPLE, true, PathBuf::from("/work")).unwrap();
        let names: Vec<&str> = cfg.servers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["calc", "search", "remote"]);

        let calc = cfg.backend("calc").unwrap();
        assert_eq!(calc.name, "calc");
        assert_eq!(calc.kind, TransportKind::Stdio);
        assert_eq!(calc.required_env, vec!["CALC_TOKEN"]);
        assert_eq!(calc.resolved_cwd(&cfg.base_dir), PathBuf::from("/work/servers/calc"));

        let search = cfg.backend("search").unwrap();
        assert_eq!(search.kind, TransportKind::Sse);
        assert_eq!(search.port, Some(9100));

        assert!(!cfg.backend("remote").unwrap().is_launchable());

        assert_eq!(cfg.settings.call_timeout_secs, 5);
        assert!(cfg.settings.require_live_backend);
        assert_eq!(cfg.settings.sse_path, "/sse");
        assert_eq!(cfg.settings.base_port, 8000);
        assert_eq!(
            cfg.settings.connection_timeouts().call,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_agents_and_handoffs_parse() {
        let cfg = parse_config(
            r#"{
                "servers": {"calc": {}},
                "agents": [
                    {"name": "triage", "handoff": {"route": {
                        "rules": [{"when": "sum", "to": "adder"}],
                        "otherwise": "echo"
                    }}},
                    {"name": "adder", "instructions": "calc.add {input}",
                     "tools": ["calc"], "handoff": "terminal"},
                    {"name": "echo", "handoff": {"to": "adder"}}
                ]
            }"#,
            true,
            PathBuf::from("."),
        )
        .unwrap();

        assert_eq!(cfg.agents.len(), 3);
        assert_eq!(
            cfg.agents[0].handoff,
            HandoffConfig::Route {
                rules: vec![RouteRule {
                    when: "sum".into(),
                    to: "adder".into()
                }],
                otherwise: Some("echo".into()),
            }
        );
        assert_eq!(cfg.agents[1].tools, Some(vec!["calc".to_string()]));
        assert_eq!(cfg.agents[1].handoff, HandoffConfig::Terminal);
        assert_eq!(cfg.agents[2].handoff, HandoffConfig::To("adder".into()));
        assert!(cfg.agents[2].instructions.is_empty());

        let bare = parse_config(SAMPLE, true, PathBuf::from(".")).unwrap();
        assert!(bare.agents.is_empty());
    }

    #[test]
    fn test_env_as_map_uses_keys() {
        let yaml = "servers:\n  mail:\n    command: node\n    env:\n      GMAIL_USER: ''\n      GMAIL_TOKEN: x\n";
        let cfg = parse_config(yaml, false, PathBuf::from(".")).unwrap();
        assert_eq!(
            cfg.backend("mail").unwrap().required_env,
            vec!["GMAIL_USER", "GMAIL_TOKEN"]
        );
    }

    #[test]
    fn test_empty_servers_rejected() {
        let err = parse_config(r#"{"servers": {}}"#, true, PathBuf::from(".")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_dotted_name_rejected() {
        let err = parse_config(r#"{"servers": {"a.b": {}}}"#, true, PathBuf::from("."))
            .unwrap_err();
        assert!(err.to_string().contains("a.b"));
    }

    #[test]
    fn test_malformed_and_missing_file_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, McpError::ConfigError { .. }));

        let bad = dir.path().join("mcp.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            load_config(&bad).unwrap_err(),
            McpError::ConfigError { .. }
        ));
    }

    #[test]
    fn test_load_sets_base_dir_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.yaml");
        std::fs::write(&path, "servers:\n  calc:\n    command: calc\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.base_dir, dir.path());
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLPLANE_UNSET_VAR__");
        assert_eq!(
            interpolate_env_vars("${__TOOLPLANE_UNSET_VAR__:-http://localhost:{port}}"),
            "http://localhost:{port}"
        );
        std::env::set_var("__TOOLPLANE_SET_VAR__", "https://cs-{port}.example.dev");
        assert_eq!(
            interpolate_env_vars("${__TOOLPLANE_SET_VAR__:-x}"),
            "https://cs-{port}.example.dev"
        );
        std::env::remove_var("__TOOLPLANE_SET_VAR__");
    }

    #[test]
    fn test_advertised_url_and_gateway_command() {
        let settings = ControlPlaneSettings::default();
        assert_eq!(settings.advertised_url(8003), "http://localhost:8003");
        let (program, args) = settings.gateway_command().unwrap();
        assert_eq!(program, "npx");
        assert_eq!(args, vec!["-y", "supergateway"]);

        let empty = ControlPlaneSettings {
            gateway: "  ".into(),
            ..Default::default()
        };
        assert!(empty.gateway_command().is_err());
    }

    #[test]
    fn test_missing_env_reports_unset_vars() {
        std::env::remove_var("__TOOLPLANE_REQUIRED__");
        let spec = BackendSpec {
            name: "x".into(),
            kind: TransportKind::Sse,
            command: Some("x".into()),
            args: vec![],
            required_env: vec!["__TOOLPLANE_REQUIRED__".into()],
            cwd: None,
            port: None,
        };
        assert_eq!(spec.missing_env(), vec!["__TOOLPLANE_REQUIRED__"]);
    }
}
