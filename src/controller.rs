//! Lifecycle controller.
//!
//! One bootstrap cycle, in strict order:
//! 1. bootstrap: launch backends (or attach to a runtime map) and resolve
//!    them against the configuration
//! 2. connect, verify and list every endpoint in parallel
//! 3. run the caller's work (sessions, single calls) against the registry
//! 4. disconnect live connections one by one, newest first
//! 5. stop every process the supervisor launched
//!
//! Steps 4 and 5 run on every exit path: work that fails, a build that
//! fails, and an interrupt (Ctrl-C, or SIGTERM on unix) at any step.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
#[cfg(unix)]
use tokio::signal::unix::SignalKind;
use tokio::sync::Notify;

use crate::agent_core::{AgentRunner, Session, SessionError, Topology};
use crate::config::ToolplaneConfig;
use crate::mcp_client::connection::BackendConnection;
use crate::mcp_client::discovery::{self, RuntimeMap};
use crate::mcp_client::dispatcher::Dispatcher;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::{Registry, RegistryBuilder};
use crate::mcp_client::report::{BootstrapReport, SkippedBackend};
use crate::mcp_client::supervisor::{LaunchReport, ProcessSupervisor};
use crate::mcp_client::transport::{SseTransportFactory, TransportFactory};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Configuration, bootstrap or dispatch failure.
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// A signal (or an explicit interrupt) arrived; teardown still ran.
    #[error("interrupted")]
    Interrupted,
}

// ─── Control plane ───────────────────────────────────────────────────────────

/// Where the endpoints come from.
#[derive(Debug, Clone)]
pub enum BootstrapSource {
    /// Read a runtime map written by a separate gateway process.
    Attach { runtime_map: PathBuf },
    /// Launch backends here, optionally writing the resulting runtime map.
    Launch { write_runtime_map: Option<PathBuf> },
}

/// What the caller's work gets to use: the registry snapshot, a dispatcher
/// over it, and the startup report.
#[derive(Clone)]
pub struct ControlPlane {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    report: BootstrapReport,
}

impl ControlPlane {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn report(&self) -> &BootstrapReport {
        &self.report
    }

    /// A session over this registry.
    pub fn session(
        &self,
        topology: Topology,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Session, SessionError> {
        Session::new(topology, runner, self.dispatcher.clone())
    }
}

// ─── Controller ──────────────────────────────────────────────────────────────

pub struct LifecycleController {
    config: ToolplaneConfig,
    factory: Arc<dyn TransportFactory>,
    interrupt: Arc<Notify>,
    /// Signals that interrupt a cycle.
    #[cfg(unix)]
    signals: Vec<SignalKind>,
}

impl LifecycleController {
    /// Controller speaking MCP over SSE, as configured.
    pub fn new(config: ToolplaneConfig) -> Result<Self, McpError> {
        let factory = SseTransportFactory::new(
            &config.settings.sse_path,
            config.settings.connection_timeouts().connect,
        )?;
        Ok(Self::with_transport_factory(config, Arc::new(factory)))
    }

    pub fn with_transport_factory(
        config: ToolplaneConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            factory,
            interrupt: Arc::new(Notify::new()),
            #[cfg(unix)]
            signals: vec![SignalKind::interrupt(), SignalKind::terminate()],
        }
    }

    /// Replace the signals that interrupt a cycle (SIGINT and SIGTERM by default).
    #[cfg(unix)]
    pub fn with_signals(mut self, signals: Vec<SignalKind>) -> Self {
        self.signals = signals;
        self
    }

    #[cfg(unix)]
    pub fn signals(&self) -> &[SignalKind] {
        &self.signals
    }

    pub fn config(&self) -> &ToolplaneConfig {
        &self.config
    }

    /// Handle that interrupts a running cycle the same way a signal does.
    pub fn interrupt_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.interrupt)
    }

    /// Run one full bootstrap → work → teardown cycle.
    pub async fn run<T, F, Fut>(&self, source: BootstrapSource, work: F) -> Result<T, ControllerError>
    where
        F: FnOnce(ControlPlane) -> Fut,
        Fut: Future<Output = Result<T, ControllerError>>,
    {
        let mut supervisor = ProcessSupervisor::new(&self.config);
        let mut connections = Vec::new();

        let outcome = self
            .bootstrap_and_work(&mut supervisor, &mut connections, source, work)
            .await;

        disconnect_all(&connections).await;
        let stopped = supervisor.terminate_all().await;
        if !stopped.is_empty() {
            tracing::info!(stopped = ?stopped, "backend processes stopped");
        }

        if let Err(e) = &outcome {
            tracing::warn!(error = %e, "control plane cycle ended with an error");
        }
        outcome
    }

    async fn bootstrap_and_work<T, F, Fut>(
        &self,
        supervisor: &mut ProcessSupervisor,
        connections: &mut Vec<Arc<BackendConnection>>,
        source: BootstrapSource,
        work: F,
    ) -> Result<T, ControllerError>
    where
        F: FnOnce(ControlPlane) -> Fut,
        Fut: Future<Output = Result<T, ControllerError>>,
    {
        let (runtime, launch_skipped) = match source {
            BootstrapSource::Attach { runtime_map } => {
                (discovery::load_runtime_map(&runtime_map)?, Vec::new())
            }
            BootstrapSource::Launch { write_runtime_map } => {
                let LaunchReport { runtime, skipped } = self
                    .interruptible(supervisor.launch_all(&self.config))
                    .await??;
                if let Some(path) = write_runtime_map {
                    discovery::write_runtime_map(&path, &runtime)?;
                }
                (runtime, skipped)
            }
        };

        let plane = self.connect(&runtime, launch_skipped, connections).await?;
        tracing::info!(
            live = plane.report.live.len(),
            skipped = plane.report.skipped.len(),
            capabilities = plane.registry.len(),
            "control plane ready"
        );

        self.interruptible(work(plane)).await?
    }

    /// Resolve the runtime map and build the registry.
    async fn connect(
        &self,
        runtime: &RuntimeMap,
        launch_skipped: Vec<SkippedBackend>,
        connections: &mut Vec<Arc<BackendConnection>>,
    ) -> Result<ControlPlane, ControllerError> {
        let resolution = discovery::resolve(&self.config, runtime);
        let settings = &self.config.settings;
        let builder = RegistryBuilder::new(
            Arc::clone(&self.factory),
            settings.connection_timeouts(),
            settings.build_policy(),
        );

        // Connections land in the caller's list before any network step, so
        // an interrupt mid-build still disconnects them.
        let build = self
            .interruptible(builder.build_tracked(&resolution.endpoints, connections))
            .await??;

        let mut report = build.report;
        // Launch failures are not in the runtime map; don't report them twice.
        let resolve_skipped = resolution
            .skipped
            .into_iter()
            .filter(|s| !launch_skipped.iter().any(|l| l.name == s.name));
        report.extend_skipped(launch_skipped.iter().cloned());
        report.extend_skipped(resolve_skipped);

        Ok(ControlPlane {
            dispatcher: Dispatcher::new(Arc::clone(&build.registry)),
            registry: build.registry,
            report,
        })
    }

    /// Launch backends, write the runtime map and keep them running until
    /// interrupted. Returns the launch report once everything is stopped.
    pub async fn serve_gateway(&self, runtime_map: PathBuf) -> Result<LaunchReport, ControllerError> {
        let mut supervisor = ProcessSupervisor::new(&self.config);
        let outcome = self.gateway_cycle(&mut supervisor, &runtime_map).await;
        let stopped = supervisor.terminate_all().await;
        tracing::info!(stopped = ?stopped, "gateway stopped");
        outcome
    }

    async fn gateway_cycle(
        &self,
        supervisor: &mut ProcessSupervisor,
        runtime_map: &Path,
    ) -> Result<LaunchReport, ControllerError> {
        let report = self
            .interruptible(supervisor.launch_all(&self.config))
            .await??;
        discovery::write_runtime_map(runtime_map, &report.runtime)?;
        for skipped in &report.skipped {
            tracing::warn!(backend = %skipped.name, reason = %skipped.reason, "backend not running");
        }
        tracing::info!(
            running = report.runtime.len(),
            runtime_map = %runtime_map.display(),
            "gateway running until interrupted"
        );
        self.wait_for_interrupt().await;
        Ok(report)
    }

    /// Run `fut` unless an interrupt arrives first.
    async fn interruptible<T>(&self, fut: impl Future<Output = T>) -> Result<T, ControllerError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.wait_for_interrupt() => {
                tracing::warn!("interrupt received, tearing down");
                Err(ControllerError::Interrupted)
            }
        }
    }

    async fn wait_for_interrupt(&self) {
        tokio::select! {
            _ = self.wait_for_signal() => {}
            _ = self.interrupt.notified() => {}
        }
    }

    #[cfg(unix)]
    async fn wait_for_signal(&self) {
        use tokio::signal::unix::signal;

        let mut streams = Vec::with_capacity(self.signals.len());
        for kind in &self.signals {
            match signal(*kind) {
                Ok(stream) => streams.push(stream),
                Err(e) => tracing::debug!(signal = ?kind, error = %e, "signal handler unavailable"),
            }
        }
        if streams.is_empty() {
            std::future::pending::<()>().await;
        }
        futures::future::select_all(streams.iter_mut().map(|s| Box::pin(s.recv()))).await;
    }

    #[cfg(not(unix))]
    async fn wait_for_signal(&self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::debug!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

/// Disconnect newest first, one at a time. A failed disconnect is logged and
/// the rest still run. Connections already `Failed` or `Disconnected` are
/// passed over. Returns the names in the order they were attempted.
pub async fn disconnect_all(connections: &[Arc<BackendConnection>]) -> Vec<String> {
    let mut order = Vec::with_capacity(connections.len());
    for conn in connections.iter().rev() {
        if conn.state().is_terminal() {
            continue;
        }
        match conn.disconnect().await {
            Ok(()) => tracing::info!(backend = %conn.name(), "disconnected"),
            Err(e) => tracing::warn!(backend = %conn.name(), error = %e, "disconnect failed"),
        }
        order.push(conn.name().to_string());
    }
    order
}

// ─── Tests ───────────────────────────────────────────────────────────────────
