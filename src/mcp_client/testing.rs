//! In-process fake backends for unit tests.
//!
//! A [`FakeFactory`] hands out [`FakeTransport`]s that answer `tools/list`
//! and `tools/call` from a scripted [`FakeBehavior`] and record every
//! open, call and close in a shared [`CallLog`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::errors::McpError;
use super::lock;
use super::transport::{Transport, TransportFactory};
use super::types::{InitializeResult, RuntimeEndpoint};

/// Ordered record of transport activity across all fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        lock(&self.0).push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Entries starting with `prefix`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// How a fake backend behaves.
#[derive(Clone, Default)]
pub struct FakeBehavior {
    /// (name, description) of each advertised function.
    pub tools: Vec<(String, String)>,
    pub refuse: bool,
    pub wrong_protocol: bool,
    pub fail_list: bool,
    pub fail_close: bool,
    /// Page size for `tools/list`; 0 means one page.
    pub page_size: usize,
    pub list_delay: Duration,
    pub call_delay: Duration,
    pub dead: Arc<AtomicBool>,
}

impl FakeBehavior {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names
                .iter()
                .map(|n| (n.to_string(), format!("{n} function")))
                .collect(),
            ..Default::default()
        }
    }

    /// Simulate the backend process dying.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    name: String,
    behavior: FakeBehavior,
    log: CallLog,
}

impl FakeTransport {
    pub fn new(name: &str, behavior: FakeBehavior, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            log,
        }
    }

    fn check_alive(&self) -> Result<(), McpError> {
        if self.behavior.dead.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionFailed {
                backend: self.name.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn list_page(&self, params: Option<Value>) -> Value {
        let tools: Vec<Value> = self
            .behavior
            .tools
            .iter()
            .map(|(name, desc)| {
                json!({
                    "name": name,
                    "description": desc,
                    "inputSchema": {"type": "object", "properties": {}},
                })
            })
            .collect();
        if self.behavior.page_size == 0 {
            return json!({ "tools": tools });
        }
        let start: usize = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(|c| c.as_str())
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = (start + self.behavior.page_size).min(tools.len());
        let mut page = json!({ "tools": tools[start..end].to_vec() });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    fn call(&self, params: Option<Value>) -> Value {
        let params = params.unwrap_or(Value::Null);
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];
        match name {
            "add" => {
                let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                json!({"content": [{"type": "text", "text": sum.to_string()}]})
            }
            "explode" => json!({
                "content": [{"type": "text", "text": "division by zero"}],
                "isError": true,
            }),
            other => json!({"content": [{"type": "text", "text": format!("{other}: {args}")}]}),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self) -> Result<(), McpError> {
        self.log.push(format!("open:{}", self.name));
        if self.behavior.refuse {
            return Err(McpError::ConnectionFailed {
                backend: self.name.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn probe(&self) -> Result<InitializeResult, McpError> {
        if self.behavior.wrong_protocol {
            return Err(McpError::ProtocolMismatch {
                backend: self.name.clone(),
                reason: "expected an event stream, got content-type 'text/html'".into(),
            });
        }
        Ok(InitializeResult::default())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.check_alive()?;
        match method {
            "tools/list" => {
                tokio::time::sleep(self.behavior.list_delay).await;
                if self.behavior.fail_list {
                    return Err(McpError::ServerError {
                        code: -32603,
                        message: "listing exploded".into(),
                        data: None,
                    });
                }
                Ok(self.list_page(params))
            }
            "tools/call" => {
                let function = params
                    .as_ref()
                    .and_then(|p| p["name"].as_str())
                    .unwrap_or_default()
                    .to_string();
                self.log.push(format!("call:{}.{function}", self.name));
                tokio::time::sleep(self.behavior.call_delay).await;
                self.check_alive()?;
                Ok(self.call(params))
            }
            other => Err(McpError::ServerError {
                code: -32601,
                message: format!("method not found: {other}"),
                data: None,
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.log.push(format!("close:{}", self.name));
        if self.behavior.fail_close {
            return Err(McpError::ConnectionFailed {
                backend: self.name.clone(),
                reason: "close failed".into(),
            });
        }
        Ok(())
    }
}

/// Factory keyed by backend name. Unknown names are unreachable.
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub behaviors: HashMap<String, FakeBehavior>,
    pub log: CallLog,
}

impl FakeFactory {
    pub fn with(mut self, name: &str, behavior: FakeBehavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, endpoint: &RuntimeEndpoint) -> Result<Box<dyn Transport>, McpError> {
        let behavior = self.behaviors.get(&endpoint.name).cloned().unwrap_or(FakeBehavior {
            refuse: true,
            ..Default::default()
        });
        Ok(Box::new(FakeTransport::new(
            &endpoint.name,
            behavior,
            self.log.clone(),
        )))
    }
}

/// Endpoints in the given order, with placeholder addresses.
pub fn endpoints(names: &[&str]) -> Vec<RuntimeEndpoint> {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| RuntimeEndpoint::new(*n, format!("http://127.0.0.1:{}", 8000 + i)))
        .collect()
}
