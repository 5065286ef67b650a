//! Toolplane CLI
//!
//! Launch MCP tool servers, check which of them are reachable, list their
//! capabilities, call them by qualified name or run the configured agents.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use toolplane::agent_core::{AgentSpec, DirectCallRunner, SessionError, Topology};
use toolplane::config::load_config;
use toolplane::controller::{BootstrapSource, ControllerError, LifecycleController};
use toolplane::mcp_client::DispatchFailure;
use toolplane::{init_tracing, LogOptions};

#[derive(Parser)]
#[command(name = "toolplane")]
#[command(about = "Toolplane - control plane for MCP tool servers", long_about = None)]
struct Cli {
    /// Server configuration (JSON or YAML)
    #[arg(short, long, default_value = "mcp.json")]
    config: PathBuf,

    /// Write logs to <DIR>/toolplane.log instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch every configured server, write the runtime map, run until interrupted
    Gateway {
        /// Where to write the runtime map
        #[arg(long, default_value = "mcp-runtime.json")]
        runtime: PathBuf,
    },

    /// Connect to every server and report which came up
    Check {
        #[command(flatten)]
        source: SourceArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List registered capabilities
    Tools {
        #[command(flatten)]
        source: SourceArgs,

        /// Print OpenAI-style function specs
        #[arg(long)]
        json: bool,
    },

    /// Call one capability by qualified name
    Call {
        /// Qualified name, e.g. calc.add
        name: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,

        #[command(flatten)]
        source: SourceArgs,

        /// Give up after this many seconds
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// Run the agents declared under `agents` (one flat agent if none)
    Run {
        /// Input for the first agent
        prompt: String,

        #[command(flatten)]
        source: SourceArgs,

        /// Give up after this many seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Attach to servers listed in this runtime map
    #[arg(long, default_value = "mcp-runtime.json", conflicts_with = "launch")]
    runtime: PathBuf,

    /// Launch the servers here instead of attaching
    #[arg(long)]
    launch: bool,
}

impl SourceArgs {
    fn bootstrap_source(&self) -> BootstrapSource {
        if self.launch {
            BootstrapSource::Launch {
                write_runtime_map: None,
            }
        } else {
            BootstrapSource::Attach {
                runtime_map: self.runtime.clone(),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(&LogOptions {
        dir: cli.log_dir.clone(),
        json: cli.log_json,
    })
    .context("failed to initialise logging")?;

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let controller = LifecycleController::new(config)?;

    match cli.command {
        Commands::Gateway { runtime } => {
            let report = controller.serve_gateway(runtime).await?;
            for skipped in &report.skipped {
                println!("- {}: {}", skipped.name, skipped.reason);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Check { source, json } => {
            let report = controller
                .run(source.bootstrap_source(), |plane| async move {
                    Ok(plane.report().clone())
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
            Ok(if report.live.is_empty() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }

        Commands::Tools { source, json } => {
            let (specs, lines) = controller
                .run(source.bootstrap_source(), |plane| async move {
                    let registry = plane.registry();
                    let lines: Vec<String> = registry
                        .descriptors()
                        .map(|d| format!("{:<32} {}", d.qualified_name, d.description))
                        .chain(std::iter::once(registry.capability_summary()))
                        .collect();
                    Ok((registry.to_function_specs(), lines))
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&specs)?);
            } else {
                for line in lines {
                    println!("{line}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Call {
            name,
            args,
            source,
            deadline,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("arguments are not valid JSON")?;
            let input = format!("{name} {arguments}");

            let outcome = controller
                .run(source.bootstrap_source(), |plane| async move {
                    let mut session = plane.session(
                        Topology::Flat(AgentSpec::new("cli", "")),
                        Arc::new(DirectCallRunner),
                    )?;
                    if let Some(secs) = deadline {
                        session = session.with_deadline(Duration::from_secs(secs));
                    }
                    match session.run(&input).await {
                        Ok(outcome) => Ok(Ok(outcome.output)),
                        Err(SessionError::Tool(e)) => Ok(Err(DispatchFailure::from_error(&name, &e))),
                        Err(e) => Err(ControllerError::from(e)),
                    }
                })
                .await?;

            match outcome {
                Ok(output) => {
                    println!("{output}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => {
                    println!("{}", serde_json::to_string_pretty(&failure)?);
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Run {
            prompt,
            source,
            deadline,
        } => {
            let topology = Topology::from_agents(&controller.config().agents)
                .context("invalid agents configuration")?;

            let outcome = controller
                .run(source.bootstrap_source(), |plane| async move {
                    let mut session = plane.session(topology, Arc::new(DirectCallRunner))?;
                    if let Some(secs) = deadline {
                        session = session.with_deadline(Duration::from_secs(secs));
                    }
                    Ok(session.run(&prompt).await?)
                })
                .await?;

            eprintln!("stages: {}", outcome.stage_path().join(" -> "));
            println!("{}", outcome.output);
            Ok(ExitCode::SUCCESS)
        }
    }
}
