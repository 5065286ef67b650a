//! Orchestrating agent session.
//!
//! A session runs one prompt through a topology:
//! - **Flat**: a single agent that sees every registered capability.
//! - **Pipeline**: named stages, each an agent with its own instructions and
//!   tool subset. A stage's output is the next stage's input; handoffs are
//!   sequential, fixed, or routed on the stage's output.
//!
//! Every stage transition is logged and recorded with input and output
//! summaries. An overall deadline cancels the run in place: the in-flight
//! call is dropped, and backend connections stay `Connected`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::errors::SessionError;
use super::runner::{AgentRunner, ToolSurface};
use super::types::{summarize, AgentSpec, SessionOutcome, StageTransition};
use crate::config::{AgentConfig, HandoffConfig};
use crate::mcp_client::dispatcher::Dispatcher;

/// Default cap on stage transitions for pipelines with cycles.
pub const DEFAULT_MAX_TRANSITIONS: usize = 16;

// ─── Topology ────────────────────────────────────────────────────────────────

/// Routes to `to` when the stage output contains `when_output_contains`
/// (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRule {
    pub when_output_contains: String,
    pub to: String,
}

/// Where a stage hands its output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Handoff {
    /// The following stage in declaration order; terminal for the last one.
    #[default]
    Next,
    To(String),
    /// This stage's output is the session result.
    Terminal,
    /// First matching rule wins; `otherwise: None` ends the session.
    Route {
        rules: Vec<HandoffRule>,
        otherwise: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub agent: AgentSpec,
    pub handoff: Handoff,
}

/// Ordered stages; the first one is the entry point.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    max_transitions: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages that run one after the other; the last one is terminal.
    pub fn sequential(agents: impl IntoIterator<Item = AgentSpec>) -> Self {
        agents
            .into_iter()
            .fold(Self::new(), |p, agent| p.stage(agent, Handoff::Next))
    }

    pub fn stage(mut self, agent: AgentSpec, handoff: Handoff) -> Self {
        self.stages.push(Stage { agent, handoff });
        self
    }

    pub fn with_max_transitions(mut self, limit: usize) -> Self {
        self.max_transitions = limit;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.agent.name == name)
    }

    /// Check names are unique and every handoff target exists.
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |reason: String| SessionError::InvalidTopology { reason };
        if self.stages.is_empty() {
            return Err(invalid("pipeline has no stages".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.agent.name.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.agent.name)));
            }
        }
        for stage in &self.stages {
            let targets: Vec<&str> = match &stage.handoff {
                Handoff::Next | Handoff::Terminal => Vec::new(),
                Handoff::To(to) => vec![to.as_str()],
                Handoff::Route { rules, otherwise } => rules
                    .iter()
                    .map(|r| r.to.as_str())
                    .chain(otherwise.as_deref())
                    .collect(),
            };
            if let Some(missing) = targets.iter().find(|t| self.index_of(t).is_none()) {
                return Err(invalid(format!(
                    "stage '{}' hands off to unknown stage '{missing}'",
                    stage.agent.name
                )));
            }
        }
        Ok(())
    }

    /// Index of the stage after `current`, given its output.
    fn next_after(&self, current: usize, output: &str) -> Option<usize> {
        match &self.stages[current].handoff {
            Handoff::Next => (current + 1 < self.stages.len()).then_some(current + 1),
            Handoff::Terminal => None,
            Handoff::To(to) => self.index_of(to),
            Handoff::Route { rules, otherwise } => {
                let lowered = output.to_lowercase();
                rules
                    .iter()
                    .find(|r| lowered.contains(&r.when_output_contains.to_lowercase()))
                    .map(|r| r.to.as_str())
                    .or(otherwise.as_deref())
                    .and_then(|to| self.index_of(to))
            }
        }
    }
}

/// Shape of a session.
#[derive(Debug, Clone)]
pub enum Topology {
    Flat(AgentSpec),
    Pipeline(Pipeline),
}

impl Topology {
    /// Topology declared in the config's `agents` list: nothing gives one
    /// agent with every tool, one agent runs flat, more form a pipeline in
    /// declaration order.
    pub fn from_agents(agents: &[AgentConfig]) -> Result<Self, SessionError> {
        let spec = |a: &AgentConfig| {
            let spec = AgentSpec::new(a.name.clone(), a.instructions.clone());
            match &a.tools {
                Some(tools) => spec.with_tools(tools.iter().cloned()),
                None => spec,
            }
        };
        match agents {
            [] => Ok(Topology::Flat(AgentSpec::new("agent", ""))),
            [only] => Ok(Topology::Flat(spec(only))),
            many => {
                let pipeline = many.iter().fold(Pipeline::new(), |p, a| {
                    let handoff = match &a.handoff {
                        HandoffConfig::Next => Handoff::Next,
                        HandoffConfig::Terminal => Handoff::Terminal,
                        HandoffConfig::To(to) => Handoff::To(to.clone()),
                        HandoffConfig::Route { rules, otherwise } => Handoff::Route {
                            rules: rules
                                .iter()
                                .map(|r| HandoffRule {
                                    when_output_contains: r.when.clone(),
                                    to: r.to.clone(),
                                })
                                .collect(),
                            otherwise: otherwise.clone(),
                        },
                    };
                    p.stage(spec(a), handoff)
                });
                pipeline.validate()?;
                Ok(Topology::Pipeline(pipeline))
            }
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    topology: Topology,
    runner: Arc<dyn AgentRunner>,
    dispatcher: Dispatcher,
    deadline: Option<Duration>,
}

impl Session {
    /// Fails with `InvalidTopology` for a malformed pipeline.
    pub fn new(
        topology: Topology,
        runner: Arc<dyn AgentRunner>,
        dispatcher: Dispatcher,
    ) -> Result<Self, SessionError> {
        if let Topology::Pipeline(pipeline) = &topology {
            pipeline.validate()?;
        }
        Ok(Self {
            topology,
            runner,
            dispatcher,
            deadline: None,
        })
    }

    /// Bound the whole run, every stage included.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run `prompt` through the topology and return the final output.
    pub async fn run(&self, prompt: &str) -> Result<SessionOutcome, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session = %session_id, prompt = %summarize(prompt), "session started");

        let work = self.execute(&session_id, prompt);
        let outcome = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, work).await.map_err(|_| {
                tracing::warn!(
                    session = %session_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "session deadline exceeded"
                );
                SessionError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                }
            })?,
            None => work.await,
        }?;

        tracing::info!(
            session = %session_id,
            stages = outcome.transitions.len(),
            "session finished"
        );
        Ok(outcome)
    }

    async fn execute(&self, session_id: &str, prompt: &str) -> Result<SessionOutcome, SessionError> {
        let mut transitions = Vec::new();
        let output = match &self.topology {
            Topology::Flat(agent) => {
                let (output, transition) = self.run_stage(session_id, agent, prompt, None).await?;
                transitions.push(transition);
                output
            }
            Topology::Pipeline(pipeline) => {
                let stages = pipeline.stages();
                let mut current = 0;
                let mut input = prompt.to_string();
                loop {
                    if transitions.len() >= pipeline.max_transitions {
                        return Err(SessionError::HandoffLimit {
                            limit: pipeline.max_transitions,
                        });
                    }
                    let agent = &stages[current].agent;
                    let (output, mut transition) =
                        self.run_stage(session_id, agent, &input, Some(pipeline)).await?;
                    let next = pipeline.next_after(current, &output);
                    transition.next_stage = next.map(|i| stages[i].agent.name.clone());
                    log_transition(session_id, &transition);
                    transitions.push(transition);
                    match next {
                        Some(i) => {
                            current = i;
                            input = output;
                        }
                        None => break output,
                    }
                }
            }
        };

        Ok(SessionOutcome {
            session_id: session_id.to_string(),
            output,
            transitions,
        })
    }

    async fn run_stage(
        &self,
        session_id: &str,
        agent: &AgentSpec,
        input: &str,
        pipeline: Option<&Pipeline>,
    ) -> Result<(String, StageTransition), SessionError> {
        let tools = ToolSurface::for_selection(&self.dispatcher, &agent.tools);
        tracing::debug!(
            session = %session_id,
            stage = %agent.name,
            tools = tools.descriptors().len(),
            "stage started"
        );

        let started_at = Utc::now();
        let clock = Instant::now();
        let run = self.runner.run(agent, input, &tools).await.map_err(|e| {
            tracing::warn!(session = %session_id, stage = %agent.name, error = %e, "stage failed");
            e
        })?;

        let transition = StageTransition {
            stage: agent.name.clone(),
            input_summary: summarize(input),
            output_summary: summarize(&run.final_output),
            next_stage: None,
            steps: run.steps,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
        };
        if pipeline.is_none() {
            log_transition(session_id, &transition);
        }
        Ok((run.final_output, transition))
    }
}

fn log_transition(session_id: &str, t: &StageTransition) {
    tracing::info!(
        session = %session_id,
        stage = %t.stage,
        input = %t.input_summary,
        output = %t.output_summary,
        next = t.next_stage.as_deref().unwrap_or("-"),
        elapsed_ms = t.elapsed_ms,
        "stage transition"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────
