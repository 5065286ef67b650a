//! Capability registry and its builder.
//!
//! The builder connects to every resolved endpoint at once, waits for all of
//! them, and only then hands out a [`Registry`]. The registry is immutable
//! after that: a new bootstrap cycle builds a new one rather than patching
//! the old.
//!
//! Keys are qualified names, `backend.function`, so two backends that both
//! expose `hello` register as `a.hello` and `b.hello`.

use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexMap;

use super::connection::{BackendConnection, ConnectionTimeouts};
use super::errors::McpError;
use super::report::{BootstrapReport, LiveBackend, SkipReason};
use super::transport::TransportFactory;
use super::types::{CapabilityDescriptor, RuntimeEndpoint};

// ─── Registry ────────────────────────────────────────────────────────────────

/// One registered capability and the connection that serves it.
#[derive(Clone)]
pub struct RegistryEntry {
    pub connection: Arc<BackendConnection>,
    pub descriptor: CapabilityDescriptor,
}

/// Snapshot of every capability offered by the live backends.
#[derive(Clone, Default)]
pub struct Registry {
    entries: IndexMap<String, RegistryEntry>,
}

impl Registry {
    /// Look up a capability by its qualified name. No fuzzy matching.
    pub fn get(&self, qualified_name: &str) -> Option<&RegistryEntry> {
        self.entries.get(qualified_name)
    }

    pub fn descriptor(&self, qualified_name: &str) -> Option<&CapabilityDescriptor> {
        self.get(qualified_name).map(|e| &e.descriptor)
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }

    pub fn qualified_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.entries.contains_key(qualified_name)
    }

    /// Backends with at least one capability, in registration order.
    pub fn backend_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in self.entries.values() {
            if !names.contains(&entry.descriptor.backend.as_str()) {
                names.push(&entry.descriptor.backend);
            }
        }
        names
    }

    pub fn tools_for_backend(&self, backend: &str) -> usize {
        self.descriptors().filter(|d| d.backend == backend).count()
    }

    /// One-line overview for an agent's instructions.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }
        let parts: Vec<String> = self
            .backend_names()
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_backend(name)))
            .collect();
        format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            parts.len(),
            parts.join(", ")
        )
    }

    /// Every capability as an OpenAI-style function spec.
    pub fn to_function_specs(&self) -> Vec<serde_json::Value> {
        self.descriptors().map(function_spec).collect()
    }

    /// Insert, refusing to overwrite an existing qualified name.
    fn insert(&mut self, connection: &Arc<BackendConnection>, descriptor: CapabilityDescriptor) {
        if self.entries.contains_key(&descriptor.qualified_name) {
            tracing::warn!(
                tool = %descriptor.qualified_name,
                "duplicate capability advertised, keeping the first"
            );
            return;
        }
        self.entries.insert(
            descriptor.qualified_name.clone(),
            RegistryEntry {
                connection: Arc::clone(connection),
                descriptor,
            },
        );
    }
}

/// OpenAI-style `{"type": "function", ...}` spec for one capability.
pub fn function_spec(descriptor: &CapabilityDescriptor) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": descriptor.qualified_name,
            "description": descriptor.description,
            "parameters": descriptor.parameters,
        }
    })
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// What to do when no backend survives the build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildPolicy {
    /// Fail with `NoLiveBackends` instead of returning an empty registry.
    pub require_live_backend: bool,
}

/// Output of one build: the registry, the live connections in creation
/// order, and the startup report.
pub struct RegistryBuild {
    pub registry: Arc<Registry>,
    pub connections: Vec<Arc<BackendConnection>>,
    pub report: BootstrapReport,
}

pub struct RegistryBuilder {
    factory: Arc<dyn TransportFactory>,
    timeouts: ConnectionTimeouts,
    policy: BuildPolicy,
}

impl RegistryBuilder {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        timeouts: ConnectionTimeouts,
        policy: BuildPolicy,
    ) -> Self {
        Self {
            factory,
            timeouts,
            policy,
        }
    }

    /// Connect, verify and list every endpoint concurrently, then merge.
    ///
    /// A backend that fails any step is left out and reported. The build
    /// itself fails only when nothing came up and the policy demands a live
    /// backend.
    pub async fn build(&self, endpoints: &[RuntimeEndpoint]) -> Result<RegistryBuild, McpError> {
        let mut created = Vec::with_capacity(endpoints.len());
        self.build_tracked(endpoints, &mut created).await
    }

    /// Like [`build`](Self::build), but every connection is pushed onto
    /// `created` as soon as it exists, before any network step. If this
    /// future is dropped part-way, the caller still holds every connection
    /// it has to disconnect.
    pub async fn build_tracked(
        &self,
        endpoints: &[RuntimeEndpoint],
        created: &mut Vec<Arc<BackendConnection>>,
    ) -> Result<RegistryBuild, McpError> {
        let mut report = BootstrapReport::default();

        // Connections are created in endpoint order; that order is the
        // reverse of teardown.
        let first = created.len();
        for endpoint in endpoints {
            match self.factory.create(endpoint) {
                Ok(transport) => created.push(Arc::new(BackendConnection::new(
                    endpoint.clone(),
                    transport,
                    self.timeouts,
                ))),
                Err(e) => {
                    tracing::warn!(backend = %endpoint.name, error = %e, "skipping backend");
                    report.skip(&endpoint.name, SkipReason::from_error(&e));
                }
            }
        }
        let fresh: Vec<Arc<BackendConnection>> = created[first..].to_vec();

        let outcomes = join_all(fresh.iter().map(|conn| bring_up(conn))).await;

        let mut registry = Registry::default();
        let mut connections = Vec::new();
        for (conn, outcome) in fresh.into_iter().zip(outcomes) {
            match outcome {
                Ok(capabilities) => {
                    tracing::info!(
                        backend = %conn.name(),
                        capabilities = capabilities.len(),
                        "backend connected"
                    );
                    report.live.push(LiveBackend {
                        name: conn.name().to_string(),
                        capability_count: capabilities.len(),
                        server_name: conn.server_name(),
                    });
                    for descriptor in capabilities {
                        registry.insert(&conn, descriptor);
                    }
                    connections.push(conn);
                }
                Err(e) => {
                    tracing::warn!(backend = %conn.name(), error = %e, "skipping backend");
                    report.skip(conn.name(), SkipReason::from_error(&e));
                }
            }
        }

        if connections.is_empty() && self.policy.require_live_backend {
            return Err(McpError::NoLiveBackends {
                attempted: endpoints.len(),
            });
        }

        Ok(RegistryBuild {
            registry: Arc::new(registry),
            connections,
            report,
        })
    }
}

/// connect → verify → list for one backend.
async fn bring_up(conn: &BackendConnection) -> Result<Vec<CapabilityDescriptor>, McpError> {
    conn.establish().await?;
    conn.list_capabilities().await
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::mcp_client::connection::ConnectionState;
    use crate::mcp_client::testing::{endpoints, FakeBehavior, FakeFactory};

    fn builder(factory: FakeFactory, policy: BuildPolicy) -> RegistryBuilder {
        RegistryBuilder::new(
            Arc::new(factory),
            ConnectionTimeouts {
                list: Duration::from_millis(300),
                ..Default::default()
            },
            policy,
        )
    }

    #[tokio::test]
    async fn test_registry_is_union_of_healthy_backends() {
        let factory = FakeFactory::default()
            .with("calc", FakeBehavior::with_tools(&["add", "sub"]))
            .with(
                "docs",
                FakeBehavior {
                    wrong_protocol: true,
                    ..FakeBehavior::with_tools(&["read"])
                },
            )
            .with(
                "broken",
                FakeBehavior {
                    fail_list: true,
                    ..FakeBehavior::with_tools(&["x"])
                },
            )
            .with("weather", FakeBehavior::with_tools(&["forecast"]));

        let build = builder(factory, BuildPolicy::default())
            .build(&endpoints(&["calc", "docs", "broken", "weather", "offline"]))
            .await
            .unwrap();

        let mut names = build.registry.qualified_names();
        names.sort();
        assert_eq!(names, vec!["calc.add", "calc.sub", "weather.forecast"]);

        assert!(matches!(
            build.report.skip_reason("docs"),
            Some(SkipReason::ProtocolMismatch(_))
        ));
        assert!(matches!(
            build.report.skip_reason("offline"),
            Some(SkipReason::Unreachable(_))
        ));
        assert!(build.report.skip_reason("broken").is_some());

        let live: Vec<&str> = build.connections.iter().map(|c| c.name()).collect();
        assert_eq!(live, vec!["calc", "weather"]);
        assert!(build
            .connections
            .iter()
            .all(|c| c.state() == ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_same_function_on_two_backends_does_not_collide() {
        let factory = FakeFactory::default()
            .with("a", FakeBehavior::with_tools(&["hello"]))
            .with("b", FakeBehavior::with_tools(&["hello"]));
        let build = builder(factory, BuildPolicy::default())
            .build(&endpoints(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(build.registry.len(), 2);
        assert_eq!(build.registry.descriptor("a.hello").unwrap().backend, "a");
        assert_eq!(build.registry.descriptor("b.hello").unwrap().backend, "b");
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_delay_others_beyond_its_timeout() {
        let factory = FakeFactory::default()
            .with(
                "slow",
                FakeBehavior {
                    list_delay: Duration::from_secs(10),
                    ..FakeBehavior::with_tools(&["crawl"])
                },
            )
            .with("fast", FakeBehavior::with_tools(&["ping"]));

        let started = Instant::now();
        let build = builder(factory, BuildPolicy::default())
            .build(&endpoints(&["slow", "fast"]))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(build.registry.qualified_names(), vec!["fast.ping"]);
        assert!(matches!(
            build.report.skip_reason("slow"),
            Some(SkipReason::TimedOut(_))
        ));
    }

    #[tokio::test]
    async fn test_require_live_backend_policy() {
        let eps = endpoints(&["gone"]);

        let lenient = builder(FakeFactory::default(), BuildPolicy::default())
            .build(&eps)
            .await
            .unwrap();
        assert!(lenient.registry.is_empty());

        let strict = builder(
            FakeFactory::default(),
            BuildPolicy {
                require_live_backend: true,
            },
        )
        .build(&eps)
        .await;
        assert!(matches!(
            strict,
            Err(McpError::NoLiveBackends { attempted: 1 })
        ));
    }

    #[tokio::test]
    async fn test_summary_and_function_specs() {
        let factory = FakeFactory::default()
            .with("calc", FakeBehavior::with_tools(&["add", "sub"]))
            .with("search", FakeBehavior::with_tools(&["query"]));
        let build = builder(factory, BuildPolicy::default())
            .build(&endpoints(&["calc", "search"]))
            .await
            .unwrap();

        assert_eq!(
            build.registry.capability_summary(),
            "Available capabilities (3 tools across 2 servers): calc (2), search (1)."
        );
        let specs = build.registry.to_function_specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0]["type"], "function");
        assert_eq!(specs[0]["function"]["name"], "calc.add");
    }

    #[tokio::test]
    async fn test_cancelled_build_leaves_connections_with_caller() {
        let factory = FakeFactory::default()
            .with("calc", FakeBehavior::with_tools(&["add"]))
            .with(
                "slow",
                FakeBehavior {
                    list_delay: Duration::from_secs(20),
                    ..FakeBehavior::with_tools(&["crunch"])
                },
            );
        let builder = builder(factory, BuildPolicy::default());
        let mut created = Vec::new();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            builder.build_tracked(&endpoints(&["calc", "slow"]), &mut created),
        )
        .await;

        assert!(cancelled.is_err());
        let names: Vec<&str> = created.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["calc", "slow"]);
        assert!(created
            .iter()
            .all(|c| c.state() == ConnectionState::Connected));
    }
}
