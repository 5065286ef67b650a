//! In-process MCP-over-SSE server for transport and controller tests.
//!
//! Serves `GET /sse` (first event: `endpoint` → `/messages?session_id=N`)
//! and `POST /messages`, answering on the stream. Tools: `add` (sums `a`
//! and `b`) and `slow` (sleeps for `call_delay`).

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::lock;

type EventTx = mpsc::Sender<Result<Event, Infallible>>;

#[derive(Debug, Clone, Default)]
pub struct TestServerOptions {
    /// Answer the probe with `text/html` instead of an event stream.
    pub plain_probe: bool,
    pub call_delay: Duration,
}

struct ServerState {
    options: TestServerOptions,
    sessions: Mutex<HashMap<String, EventTx>>,
    next_session: AtomicU64,
    killed: AtomicBool,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(options: TestServerOptions) -> Self {
        let state = Arc::new(ServerState {
            options,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            killed: AtomicBool::new(false),
        });
        let app = Router::new()
            .route("/sse", get(open_stream))
            .route("/messages", post(receive_message))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Behave like a crashed process: streams end, nothing is accepted.
    pub fn kill(&self) {
        self.state.killed.store(true, Ordering::SeqCst);
        lock(&self.state.sessions).clear();
        self.task.abort();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn open_stream(State(state): State<Arc<ServerState>>) -> Response {
    if state.options.plain_probe {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html")],
            "<html>not an event stream</html>",
        )
            .into_response();
    }

    let id = state.next_session.fetch_add(1, Ordering::SeqCst).to_string();
    let (tx, rx) = mpsc::channel(32);
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={id}"));
    let _ = tx.send(Ok(endpoint)).await;
    lock(&state.sessions).insert(id, tx);
    Sse::new(ReceiverStream::new(rx)).into_response()
}

async fn receive_message(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(message): Json<Value>,
) -> StatusCode {
    if state.killed.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let Some(session) = query.get("session_id") else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(tx) = lock(&state.sessions).get(session).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED; // notification
    };

    let delay = state.options.call_delay;
    tokio::spawn(async move {
        let reply = match respond(&message, delay).await {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, msg)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": msg}})
            }
        };
        let event = Event::default().event("message").data(reply.to_string());
        let _ = tx.send(Ok(event)).await;
    });
    StatusCode::ACCEPTED
}

async fn respond(message: &Value, delay: Duration) -> Result<Value, (i32, String)> {
    let params = &message["params"];
    match message["method"].as_str().unwrap_or_default() {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "test-calc", "version": "0.0.1"},
        })),
        "tools/list" => Ok(json!({
            "tools": [
                {
                    "name": "add",
                    "description": "Add two numbers",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                        "required": ["a", "b"],
                    },
                },
                {"name": "slow", "description": "Take a while"},
            ]
        })),
        "tools/call" => match params["name"].as_str().unwrap_or_default() {
            "add" => {
                let args = &params["arguments"];
                let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                Ok(json!({"content": [{"type": "text", "text": sum.to_string()}]}))
            }
            "slow" => {
                tokio::time::sleep(delay).await;
                Ok(json!({"content": [{"type": "text", "text": "done"}]}))
            }
            other => Err((-32602, format!("unknown tool: {other}"))),
        },
        other => Err((-32601, format!("method not found: {other}"))),
    }
}
