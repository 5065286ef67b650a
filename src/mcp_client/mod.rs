//! MCP client: discovery, connection lifecycle and dispatch for tool servers.
//!
//! This module handles:
//! - Launching backends as child processes and recording where they listen
//! - Resolving configured backends against a runtime endpoint map
//! - One MCP-over-SSE connection per backend, with protocol verification
//! - Building the qualified-name capability registry in parallel
//! - Routing calls by qualified name to the owning connection

pub mod connection;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod registry;
pub mod report;
pub mod sse;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_server;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports for convenience
pub use connection::{BackendConnection, ConnectionState, ConnectionTimeouts};
pub use dispatcher::Dispatcher;
pub use errors::{DispatchFailure, FailureKind, McpError};
pub use registry::{BuildPolicy, Registry, RegistryBuild, RegistryBuilder};
pub use report::{BootstrapReport, SkipReason};
pub use transport::{SseTransportFactory, Transport, TransportFactory};
pub use types::{CapabilityDescriptor, RuntimeEndpoint, ToolCallResult};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
