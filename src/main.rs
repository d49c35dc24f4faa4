// src/main.rs
//! Testrun Engine
//!
//! `testrun-engine run` executes test suites in agent processes and prints
//! their events. `testrun-engine agent` is the agent itself; the engine
//! launches it, users normally do not.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use testrun_engine::model::{Bitness, ProcessIsolation};
use testrun_engine::observability::{init_metrics, init_tracing};
use testrun_engine::runtime::AgentBootstrap;
use testrun_engine::{
    AgentId, BuildInfo, Engine, EngineConfig, RunEvent, RunOutcome, RuntimeTarget, TestFilter,
    TestOutcome, TestPackage,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "testrun-engine", version, about = "Out-of-process test execution engine")]
struct Cli {
    /// Configuration file (defaults to testrun.{toml,yaml,json} if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run test suites and print their events
    Run(RunArgs),

    /// Serve as an agent for an engine (launched by the engine)
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Suite manifests to run
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Target runtime framework
    #[arg(long)]
    runtime: Option<String>,

    /// Target bitness (any, x86, x64)
    #[arg(long, default_value = "any")]
    bitness: Bitness,

    /// Only run tests whose full name contains this (repeatable)
    #[arg(long = "filter")]
    include: Vec<String>,

    /// Skip tests whose full name contains this (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Use a fresh agent for this run
    #[arg(long)]
    per_run: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Agency address to connect back to
    #[arg(long)]
    endpoint: SocketAddr,

    #[arg(long)]
    agent_id: AgentId,

    #[arg(long, default_value = "any")]
    runtime: String,

    #[arg(long, default_value = "any")]
    bitness: Bitness,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = EngineConfig::load_from(cli.config.as_deref())
        .context("failed to load configuration")?;

    init_tracing(&config.logging);

    match cli.command {
        Command::Run(args) => {
            init_metrics(&config.metrics)?;
            run(config, args).await
        }
        Command::Agent(args) => {
            let bootstrap = AgentBootstrap {
                agent_id: args.agent_id,
                endpoint: args.endpoint,
                runtime: RuntimeTarget::new(args.runtime).with_bitness(args.bitness),
            };
            testrun_engine::agent::run_agent(bootstrap)
                .await
                .context("agent failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: EngineConfig, args: RunArgs) -> Result<ExitCode> {
    info!("Starting Testrun Engine {}", BuildInfo::current());

    let runtime = args
        .runtime
        .unwrap_or_else(|| config.agent.default_runtime.clone());
    let mut package = TestPackage::new(args.paths)
        .with_runtime(RuntimeTarget::new(runtime).with_bitness(args.bitness));
    if args.per_run {
        package = package.with_isolation(ProcessIsolation::PerRun);
    }
    package.working_dir = Some(std::env::current_dir()?);

    let filter = TestFilter {
        include: args.include,
        exclude: args.exclude,
    };

    let engine = Engine::start(config).await?;
    let mut handle = match engine.submit_run(package, filter).await {
        Ok(handle) => handle,
        Err(e) => {
            engine.shutdown().await;
            return Err(e).context("run could not be started");
        }
    };

    let mut succeeded = false;
    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling run");
                handle.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }

        if let RunEvent::RunCompleted {
            summary,
            outcome: RunOutcome::Finished,
            ..
        } = &event
        {
            succeeded = summary.is_success();
        }
    }

    engine.shutdown().await;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Started {
            agent_id,
            test_count,
            ..
        } => println!("Running {} tests on agent {}", test_count, agent_id),
        RunEvent::TestCaseResult { result, .. } => {
            let label = match result.outcome {
                TestOutcome::Passed => "PASS",
                TestOutcome::Failed => "FAIL",
                TestOutcome::Skipped => "SKIP",
                TestOutcome::Error => "ERROR",
            };
            match &result.message {
                Some(message) => println!(
                    "{:>5} {} ({} ms): {}",
                    label,
                    result.full_name(),
                    result.duration_ms,
                    message
                ),
                None => println!(
                    "{:>5} {} ({} ms)",
                    label,
                    result.full_name(),
                    result.duration_ms
                ),
            }
        }
        RunEvent::Progress { .. } => {}
        RunEvent::RunCompleted {
            summary, outcome, ..
        } => {
            let outcome = match outcome {
                RunOutcome::Finished => "finished",
                RunOutcome::Cancelled => "cancelled",
            };
            println!(
                "Run {}: {} total, {} passed, {} failed, {} skipped, {} errors",
                outcome,
                summary.total,
                summary.passed,
                summary.failed,
                summary.skipped,
                summary.errors
            );
        }
        RunEvent::AgentFaulted {
            agent_id, reason, ..
        } => println!("Agent {} faulted: {}", agent_id, reason),
    }
}
