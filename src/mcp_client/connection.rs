//! Backend connection state machine.
//!
//! One [`BackendConnection`] per resolved endpoint. The only successful path
//! is `Unconnected → Connecting → Verifying → Connected`; any step may drop
//! to `Failed`. `Connected → Disconnected` is the only way out of a live
//! connection, and `Failed`/`Disconnected` are terminal.
//!
//! Every network-facing step runs under its own timeout. An expired call
//! leaves the connection `Connected`: a slow call says nothing about the
//! next one.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::errors::McpError;
use super::lock;
use super::transport::Transport;
use super::types::{
    CallToolResult, CapabilityDescriptor, ListToolsResult, RuntimeEndpoint, ServerInfo,
};

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Verifying,
    Connected,
    Failed,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Verifying => "verifying",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        }
    }

    /// `Failed` and `Disconnected` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation time bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub verify: Duration,
    pub list: Duration,
    pub call: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            verify: Duration::from_secs(30),
            list: Duration::from_secs(30),
            call: Duration::from_secs(60),
        }
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// A live (or dead) link to one backend. Owns its transport exclusively.
pub struct BackendConnection {
    endpoint: RuntimeEndpoint,
    transport: Box<dyn Transport>,
    timeouts: ConnectionTimeouts,
    state: Mutex<ConnectionState>,
    server_info: Mutex<Option<ServerInfo>>,
}

impl BackendConnection {
    pub fn new(
        endpoint: RuntimeEndpoint,
        transport: Box<dyn Transport>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        Self {
            endpoint,
            transport,
            timeouts,
            state: Mutex::new(ConnectionState::Unconnected),
            server_info: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn endpoint(&self) -> &RuntimeEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Name the backend announced during the handshake, if any.
    pub fn server_name(&self) -> Option<String> {
        lock(&self.server_info)
            .as_ref()
            .and_then(|info| info.name.clone())
    }

    fn set_state(&self, next: ConnectionState) {
        *lock(&self.state) = next;
    }

    /// Move `from → to` atomically, or report the state we were really in.
    fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        operation: &str,
    ) -> Result<(), McpError> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(self.illegal(operation, *state));
        }
        *state = to;
        Ok(())
    }

    fn require(&self, expected: ConnectionState, operation: &str) -> Result<(), McpError> {
        let state = self.state();
        if state != expected {
            return Err(self.illegal(operation, state));
        }
        Ok(())
    }

    fn illegal(&self, operation: &str, state: ConnectionState) -> McpError {
        McpError::IllegalState {
            backend: self.endpoint.name.clone(),
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        operation: &str,
        fut: impl Future<Output = Result<T, McpError>>,
    ) -> Result<T, McpError> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                backend: self.endpoint.name.clone(),
                operation: operation.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Mark the connection failed and release the transport.
    async fn fail(&self, error: McpError) -> McpError {
        self.set_state(ConnectionState::Failed);
        if let Err(e) = self.transport.close().await {
            tracing::debug!(backend = %self.endpoint.name, error = %e, "close after failure");
        }
        error
    }

    // ─── Lifecycle steps ─────────────────────────────────────────────────

    /// Open the transport. Only valid once, from `Unconnected`.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.transition(
            ConnectionState::Unconnected,
            ConnectionState::Connecting,
            "connect",
        )?;
        tracing::debug!(backend = %self.endpoint.name, url = %self.endpoint.base_url, "connecting");

        match self
            .bounded(self.timeouts.connect, "connect", self.transport.open())
            .await
        {
            Ok(()) => {
                self.set_state(ConnectionState::Verifying);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Confirm the backend speaks MCP over an event stream.
    pub async fn verify_protocol(&self) -> Result<(), McpError> {
        self.require(ConnectionState::Verifying, "verify")?;

        match self
            .bounded(self.timeouts.verify, "verify", self.transport.probe())
            .await
        {
            Ok(init) => {
                *lock(&self.server_info) = init.server_info;
                self.set_state(ConnectionState::Connected);
                tracing::debug!(backend = %self.endpoint.name, "protocol verified");
                Ok(())
            }
            Err(McpError::ServerError { code, message, .. }) => {
                let err = McpError::ProtocolMismatch {
                    backend: self.endpoint.name.clone(),
                    reason: format!("handshake rejected [{code}]: {message}"),
                };
                Err(self.fail(err).await)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// `connect` followed by `verify_protocol`.
    pub async fn establish(&self) -> Result<(), McpError> {
        self.connect().await?;
        self.verify_protocol().await
    }

    /// Fetch every advertised function, following pagination cursors.
    ///
    /// A failure here marks the connection `Failed`.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, McpError> {
        self.require(ConnectionState::Connected, "list capabilities of")?;

        let listing = self.bounded(self.timeouts.list, "list capabilities", async {
            let mut capabilities = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
                let value = self.transport.request("tools/list", params).await?;
                let page: ListToolsResult =
                    serde_json::from_value(value).map_err(|e| McpError::ProtocolMismatch {
                        backend: self.endpoint.name.clone(),
                        reason: format!("invalid tools/list result: {e}"),
                    })?;
                capabilities.extend(
                    page.tools
                        .into_iter()
                        .map(|def| CapabilityDescriptor::qualify(&self.endpoint.name, def)),
                );
                match page.next_cursor {
                    Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                    _ => break,
                }
            }
            Ok(capabilities)
        });

        match listing.await {
            Ok(capabilities) => Ok(capabilities),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Forward a call. Arguments pass through untouched.
    pub async fn invoke(
        &self,
        function: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        self.require(ConnectionState::Connected, "invoke")?;

        let started = Instant::now();
        let params = serde_json::json!({ "name": function, "arguments": arguments });
        let operation = format!("call '{function}'");
        let value = self
            .bounded(
                self.timeouts.call,
                &operation,
                self.transport.request("tools/call", Some(params)),
            )
            .await
            .map_err(|e| match e {
                McpError::ServerError { code, message, .. } => McpError::InvocationFailed {
                    backend: self.endpoint.name.clone(),
                    function: function.to_string(),
                    code: Some(code),
                    message,
                },
                other => other,
            })?;

        let result: CallToolResult =
            serde_json::from_value(value).map_err(|e| McpError::InvocationFailed {
                backend: self.endpoint.name.clone(),
                function: function.to_string(),
                code: None,
                message: format!("invalid tools/call result: {e}"),
            })?;
        if result.is_error {
            return Err(McpError::InvocationFailed {
                backend: self.endpoint.name.clone(),
                function: function.to_string(),
                code: None,
                message: result.text(),
            });
        }

        tracing::debug!(
            backend = %self.endpoint.name,
            function,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "call complete"
        );
        Ok(result)
    }

    /// Release the transport.
    ///
    /// No-op on a `Failed` or `Disconnected` connection. The state ends up
    /// `Disconnected` even when closing the transport reports an error.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return Ok(());
            }
            *state = ConnectionState::Disconnected;
        }
        tracing::debug!(backend = %self.endpoint.name, "disconnecting");
        self.transport.close().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
