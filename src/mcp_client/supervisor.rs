//! Backend process supervisor.
//!
//! Launches every configured backend that has a command, each on its own
//! port:
//! - `stdio` backends run behind the stdio→SSE gateway
//!   (`<gateway> --port P --baseUrl … --stdio "<command args>"`)
//! - `sse` backends bind the port themselves (`<command> <args> --port P`)
//!
//! Ports come from one allocation table computed up front. Fixed ports in
//! the configuration are honoured; everything else counts up from
//! `settings.base_port`. Children are killed on drop, and
//! [`ProcessSupervisor::terminate_all`] stops them in reverse launch order.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use super::discovery::RuntimeMap;
use super::errors::McpError;
use super::report::{SkipReason, SkippedBackend};
use crate::config::{BackendSpec, ControlPlaneSettings, ToolplaneConfig, TransportKind};

/// Interval between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ─── Port allocation ─────────────────────────────────────────────────────────

/// Backend name → port, in configuration order.
pub type PortTable = IndexMap<String, u16>;

/// Assign a port to every launchable backend.
///
/// Fixed ports are reserved first; two backends asking for the same port
/// is a `ConfigError`.
pub fn allocate_ports(config: &ToolplaneConfig) -> Result<PortTable, McpError> {
    let mut used: HashSet<u16> = HashSet::new();
    for spec in config.backends() {
        if let Some(port) = spec.port {
            if !used.insert(port) {
                return Err(McpError::ConfigError {
                    reason: format!("port {port} is assigned to more than one server"),
                });
            }
        }
    }

    let mut table = PortTable::new();
    let mut next = config.settings.base_port;
    for spec in config.backends().filter(|s| s.is_launchable()) {
        let port = match spec.port {
            Some(port) => port,
            None => {
                while used.contains(&next) {
                    next = next.checked_add(1).ok_or_else(|| McpError::ConfigError {
                        reason: "ran out of ports above base_port".into(),
                    })?;
                }
                used.insert(next);
                next
            }
        };
        table.insert(spec.name.clone(), port);
    }
    Ok(table)
}

// ─── Spawned processes ───────────────────────────────────────────────────────

/// A launched backend. Owned by the supervisor.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub name: String,
    pub port: u16,
    pub kind: TransportKind,
    pub base_url: String,
    child: Child,
}

impl SpawnedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }
}

/// What a launch produced.
#[derive(Debug, Default)]
pub struct LaunchReport {
    /// Where each running backend listens, in launch order.
    pub runtime: RuntimeMap,
    pub skipped: Vec<SkippedBackend>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct ProcessSupervisor {
    settings: ControlPlaneSettings,
    base_dir: PathBuf,
    processes: Vec<SpawnedProcess>,
}

impl ProcessSupervisor {
    pub fn new(config: &ToolplaneConfig) -> Self {
        Self {
            settings: config.settings.clone(),
            base_dir: config.base_dir.clone(),
            processes: Vec::new(),
        }
    }

    pub fn processes(&self) -> &[SpawnedProcess] {
        &self.processes
    }

    /// Launch every backend with a command and wait for their ports.
    ///
    /// A backend that fails to start is skipped with a reason. Externally
    /// managed backends with a fixed port are recorded as-is. Only a bad
    /// port table or an empty gateway command is fatal.
    pub async fn launch_all(
        &mut self,
        config: &ToolplaneConfig,
    ) -> Result<LaunchReport, McpError> {
        let ports = allocate_ports(config)?;
        let wraps_stdio = config
            .backends()
            .any(|s| s.is_launchable() && s.kind == TransportKind::Stdio);
        if wraps_stdio {
            self.settings.gateway_command()?;
        }
        let mut report = LaunchReport::default();
        let first_new = self.processes.len();

        for spec in config.backends() {
            let Some(&port) = ports.get(&spec.name) else {
                continue;
            };
            match self.spawn(spec, port) {
                Ok(process) => {
                    tracing::info!(
                        backend = %process.name,
                        kind = process.kind.as_str(),
                        port,
                        pid = ?process.pid(),
                        "backend launched"
                    );
                    self.processes.push(process);
                }
                Err(e) => {
                    tracing::warn!(backend = %spec.name, error = %e, "backend failed to launch");
                    report.skipped.push(SkippedBackend {
                        name: spec.name.clone(),
                        reason: SkipReason::from_error(&e),
                    });
                }
            }
        }

        let timeout = self.settings.startup_timeout();
        futures::future::join_all(
            self.processes[first_new..]
                .iter_mut()
                .map(|p| wait_until_ready(p, timeout)),
        )
        .await;

        let mut index = first_new;
        while index < self.processes.len() {
            if let Some(status) = self.processes[index].exited() {
                let process = self.processes.remove(index);
                tracing::warn!(backend = %process.name, %status, "backend exited during startup");
                report.skipped.push(SkippedBackend {
                    name: process.name,
                    reason: SkipReason::SpawnFailed(format!("exited during startup ({status})")),
                });
                continue;
            }
            let process = &self.processes[index];
            report
                .runtime
                .insert(process.name.clone(), process.base_url.clone());
            index += 1;
        }

        for spec in config.backends().filter(|s| !s.is_launchable()) {
            if let Some(port) = spec.port {
                report
                    .runtime
                    .insert(spec.name.clone(), self.settings.advertised_url(port));
            }
        }

        Ok(report)
    }

    fn spawn(&self, spec: &BackendSpec, port: u16) -> Result<SpawnedProcess, McpError> {
        let mut cmd = self.build_command(spec, port)?;
        let child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(SpawnedProcess {
            name: spec.name.clone(),
            port,
            kind: spec.kind,
            base_url: self.settings.advertised_url(port),
            child,
        })
    }

    /// The command that runs `spec` on `port`, after checking its environment
    /// and working directory.
    pub fn build_command(&self, spec: &BackendSpec, port: u16) -> Result<Command, McpError> {
        let spawn_failed = |reason: String| McpError::SpawnFailed {
            name: spec.name.clone(),
            reason,
        };

        let command = spec
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| spawn_failed("missing 'command'".into()))?;
        if let Some(var) = spec.missing_env().first() {
            return Err(spawn_failed(format!("required env var '{var}' is not set")));
        }
        let cwd = spec.resolved_cwd(&self.base_dir);
        if !cwd.is_dir() {
            return Err(spawn_failed(format!(
                "cwd {} is not a directory",
                cwd.display()
            )));
        }

        let mut cmd = match spec.kind {
            TransportKind::Stdio => {
                let (program, gateway_args) = self.settings.gateway_command()?;
                // The gateway hands this line to a shell.
                let child_cmd = shell_words::join(
                    std::iter::once(command).chain(spec.args.iter().map(String::as_str)),
                );
                let mut cmd = Command::new(program);
                cmd.args(gateway_args)
                    .arg("--port")
                    .arg(port.to_string())
                    .arg("--baseUrl")
                    .arg(format!("http://localhost:{port}"))
                    .arg("--ssePath")
                    .arg(&self.settings.sse_path)
                    .arg("--messagePath")
                    .arg(&self.settings.message_path)
                    .arg("--outputTransport")
                    .arg("sse")
                    .arg("--stdio")
                    .arg(child_cmd);
                cmd
            }
            TransportKind::Sse => {
                let mut cmd = Command::new(command);
                cmd.args(&spec.args).arg("--port").arg(port.to_string());
                cmd
            }
        };

        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        Ok(cmd)
    }

    /// Stop every process, newest first. Returns the names in stop order.
    pub async fn terminate_all(&mut self) -> Vec<String> {
        let timeout = self.settings.shutdown_timeout();
        let mut stopped = Vec::with_capacity(self.processes.len());
        while let Some(mut process) = self.processes.pop() {
            terminate(&mut process, timeout).await;
            stopped.push(process.name);
        }
        stopped
    }
}

/// Poll until the port accepts connections, the process exits, or time runs out.
async fn wait_until_ready(process: &mut SpawnedProcess, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if process.exited().is_some() {
            return false;
        }
        if TcpStream::connect(("127.0.0.1", process.port)).await.is_ok() {
            tracing::debug!(backend = %process.name, port = process.port, "backend listening");
            return true;
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                backend = %process.name,
                port = process.port,
                timeout_secs = timeout.as_secs(),
                "backend not listening yet, continuing"
            );
            return false;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Ask the process to stop, then kill it if it has not exited in time.
async fn terminate(process: &mut SpawnedProcess, timeout: Duration) {
    if let Some(status) = process.exited() {
        tracing::info!(backend = %process.name, %status, "backend already exited");
        return;
    }

    request_stop(process);
    match tokio::time::timeout(timeout, process.child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(backend = %process.name, %status, "backend stopped");
        }
        _ => {
            tracing::warn!(backend = %process.name, "backend did not stop in time, killing");
            if let Err(e) = process.child.kill().await {
                tracing::warn!(backend = %process.name, error = %e, "kill failed");
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(process: &mut SpawnedProcess) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = process.pid() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(backend = %process.name, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_stop(process: &mut SpawnedProcess) {
    if let Err(e) = process.child.start_kill() {
        tracing::debug!(backend = %process.name, error = %e, "start_kill failed");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
