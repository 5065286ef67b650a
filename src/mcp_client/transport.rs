//! JSON-RPC over HTTP + server-sent events.
//!
//! A backend exposes two HTTP surfaces:
//! - `GET {base}/sse` opens a long-lived event stream. Its first `endpoint`
//!   event names the URL that accepts requests for this session.
//! - `POST {message_url}` carries JSON-RPC requests. Responses come back as
//!   `message` events on the stream, correlated by request id.
//!
//! [`Transport`] is the seam the connection state machine talks through, so
//! tests can swap in in-process fakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::{lock, sse};
use super::types::{
    error_codes, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RuntimeEndpoint, CLIENT_NAME, PROTOCOL_VERSION,
};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Extract the result from a JSON-RPC response, converting errors.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Transport trait ─────────────────────────────────────────────────────────

/// One backend's wire connection.
///
/// Owned exclusively by a `BackendConnection`; nothing else calls it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the stream. Fails with `ConnectionFailed` when nothing answers.
    async fn open(&self) -> Result<(), McpError>;

    /// Check the opened stream speaks MCP over SSE and run the handshake.
    ///
    /// A live endpoint with the wrong status or content type is a
    /// `ProtocolMismatch`.
    async fn probe(&self) -> Result<InitializeResult, McpError>;

    /// Send a request and wait for its result.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError>;

    /// Send a notification; no response is expected.
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;

    /// Release the stream. Safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

/// Builds a transport for a resolved endpoint.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &RuntimeEndpoint) -> Result<Box<dyn Transport>, McpError>;
}

// ─── SSE transport ───────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

struct SseSession {
    message_url: Url,
    reader: JoinHandle<()>,
}

/// MCP client transport over HTTP + SSE.
pub struct SseTransport {
    backend: String,
    sse_url: Url,
    http: reqwest::Client,
    /// Opened stream, waiting to be verified.
    stream: Mutex<Option<reqwest::Response>>,
    session: Mutex<Option<SseSession>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
}

impl SseTransport {
    pub fn new(backend: &str, sse_url: Url, http: reqwest::Client) -> Self {
        Self {
            backend: backend.to_string(),
            sse_url,
            http,
            stream: Mutex::new(None),
            session: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn unreachable(&self, reason: impl Into<String>) -> McpError {
        McpError::ConnectionFailed {
            backend: self.backend.clone(),
            reason: reason.into(),
        }
    }

    fn mismatch(&self, reason: impl Into<String>) -> McpError {
        McpError::ProtocolMismatch {
            backend: self.backend.clone(),
            reason: reason.into(),
        }
    }

    fn message_url(&self) -> Result<Url, McpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.unreachable("event stream closed"));
        }
        lock(&self.session)
            .as_ref()
            .map(|s| s.message_url.clone())
            .ok_or_else(|| self.unreachable("no message endpoint (stream not verified)"))
    }

    /// Insert a response slot for `id`.
    ///
    /// The reader clears the map after setting `closed`, so a slot inserted
    /// after that clear is caught by the second check.
    fn register_pending(
        &self,
        id: u64,
        tx: oneshot::Sender<JsonRpcResponse>,
    ) -> Result<PendingSlot<'_>, McpError> {
        lock(&self.pending).insert(id, tx);
        let slot = PendingSlot {
            pending: &self.pending,
            id,
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(self.unreachable("event stream closed"));
        }
        Ok(slot)
    }

    async fn post(
        &self,
        url: Url,
        body: &impl serde::Serialize,
    ) -> Result<reqwest::Response, McpError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.unreachable(format!("POST failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(self.unreachable(format!(
                "message endpoint returned HTTP {}",
                resp.status()
            )));
        }
        Ok(resp)
    }
}

/// Removes a pending request slot when the request finishes or is cancelled.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(&self) -> Result<(), McpError> {
        let resp = self
            .http
            .get(self.sse_url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.unreachable(format!("GET {} failed: {e}", self.sse_url)))?;
        *lock(&self.stream) = Some(resp);
        Ok(())
    }

    async fn probe(&self) -> Result<InitializeResult, McpError> {
        let resp = lock(&self.stream)
            .take()
            .ok_or_else(|| self.unreachable("stream not open"))?;

        if resp.status() != StatusCode::OK {
            return Err(self.mismatch(format!("probe returned HTTP {}", resp.status())));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("event-stream") {
            return Err(self.mismatch(format!(
                "expected an event stream, got content-type '{content_type}'"
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(pump_events(
            self.backend.clone(),
            resp,
            endpoint_tx,
            Arc::clone(&self.pending),
            Arc::clone(&self.closed),
        ));
        let endpoint = match endpoint_rx.await {
            Ok(endpoint) => endpoint,
            Err(_) => {
                reader.abort();
                return Err(self.mismatch("stream ended before an endpoint event"));
            }
        };
        let message_url = match self.sse_url.join(endpoint.trim()) {
            Ok(url) => url,
            Err(e) => {
                reader.abort();
                return Err(self.mismatch(format!("bad endpoint '{endpoint}': {e}")));
            }
        };
        tracing::debug!(backend = %self.backend, %message_url, "event stream open");
        *lock(&self.session) = Some(SseSession {
            message_url,
            reader,
        });

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| self.mismatch(format!("invalid initialize result: {e}")))?;
        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let url = self.message_url()?;
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        let _slot = self.register_pending(id, tx)?;

        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.post(url, &req).await?;

        // Some servers answer inline instead of on the stream.
        let inline = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        if inline {
            if let Ok(reply) = resp.json::<JsonRpcResponse>().await {
                if reply.id == id {
                    return extract_result(reply);
                }
            }
        }

        let reply = rx
            .await
            .map_err(|_| self.unreachable("event stream closed before response"))?;
        extract_result(reply)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let url = self.message_url()?;
        let note = JsonRpcNotification::new(method, params);
        self.post(url, &note).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.closed.store(true, Ordering::Release);
        lock(&self.stream).take();
        if let Some(session) = lock(&self.session).take() {
            session.reader.abort();
        }
        lock(&self.pending).clear();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.reader.abort();
        }
    }
}

/// Reader task: routes stream events until the stream ends.
async fn pump_events(
    backend: String,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let events = sse::event_stream(response);
    futures::pin_mut!(events);

    while let Some(item) = events.next().await {
        match item {
            Ok(event) if event.event == "endpoint" => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(event.data);
                }
            }
            Ok(event) if event.event == "message" => {
                route_message(&backend, &event.data, &pending)
            }
            Ok(event) => {
                tracing::debug!(backend = %backend, event = %event.event, "ignoring event");
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "event stream read failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    lock(&pending).clear();
    tracing::debug!(backend = %backend, "event stream ended");
}

fn route_message(backend: &str, data: &str, pending: &PendingMap) {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(backend = %backend, error = %e, "unparseable message event");
            return;
        }
    };
    if value.get("method").is_some() {
        // Server-initiated request or notification.
        tracing::debug!(backend = %backend, method = %value["method"], "ignoring server message");
        return;
    }
    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => {
            if let Some(tx) = lock(pending).remove(&resp.id) {
                let _ = tx.send(resp);
            }
        }
        Err(e) => tracing::debug!(backend = %backend, error = %e, "message is not a response"),
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Creates [`SseTransport`]s sharing one HTTP client.
pub struct SseTransportFactory {
    http: reqwest::Client,
    sse_path: String,
}

impl SseTransportFactory {
    /// `connect_timeout` bounds TCP connect only; the event stream itself is
    /// long-lived.
    pub fn new(sse_path: &str, connect_timeout: Duration) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            sse_path: sse_path.to_string(),
        })
    }

    /// `{base}{sse_path}` with exactly one slash between them.
    pub fn sse_url(&self, endpoint: &RuntimeEndpoint) -> Result<Url, McpError> {
        let path = self.sse_path.trim_start_matches('/');
        let joined = format!("{}/{path}", endpoint.base_url.trim_end_matches('/'));
        Url::parse(&joined).map_err(|e| McpError::ConnectionFailed {
            backend: endpoint.name.clone(),
            reason: format!("invalid base address '{}': {e}", endpoint.base_url),
        })
    }
}

impl TransportFactory for SseTransportFactory {
    fn create(&self, endpoint: &RuntimeEndpoint) -> Result<Box<dyn Transport>, McpError> {
        let url = self.sse_url(endpoint)?;
        Ok(Box::new(SseTransport::new(
            &endpoint.name,
            url,
            self.http.clone(),
        )))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
