//! Agent Core: sessions that put registered capabilities in front of agents.
//!
//! Submodules:
//! - `runner`: The agent-runner seam and per-agent tool surfaces
//! - `session`: Flat and pipeline topologies, handoffs, deadlines
//! - `types`: Agent specs, traces and session outcomes
//! - `errors`: Session-level error types

pub mod errors;
pub mod runner;
pub mod session;
pub mod types;

pub use errors::SessionError;
pub use runner::{AgentRunner, DirectCallRunner, ToolSurface};
pub use session::{Handoff, HandoffRule, Pipeline, Session, Stage, Topology};
pub use types::{AgentRun, AgentSpec, SessionOutcome, StageTransition, StepTrace, ToolSelection};
