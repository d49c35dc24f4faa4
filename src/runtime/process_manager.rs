// src/runtime/process_manager.rs
//! Launching and reaping agent processes
//!
//! Two launchers are provided:
//! - `ProcessLauncher`: a separate OS process per agent (the agent binary,
//!   or a per-runtime override from configuration)
//! - `TaskLauncher`: an in-process agent running on the engine's runtime
//!
//! Both hand back a boxed [`AgentProcess`]. Dropping one kills what it owns.

use crate::model::{AgentId, LaunchConfiguration, RuntimeTarget};
use crate::utils::config::AgentProgramConfig;
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on waiting for a killed process to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything an agent needs to find its way back to the agency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBootstrap {
    pub agent_id: AgentId,
    pub endpoint: SocketAddr,
    pub runtime: RuntimeTarget,
}

impl AgentBootstrap {
    /// Command-line arguments understood by the `agent` subcommand
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--endpoint".to_string(),
            self.endpoint.to_string(),
            "--agent-id".to_string(),
            self.agent_id.to_string(),
            "--runtime".to_string(),
            self.runtime.framework.clone(),
            "--bitness".to_string(),
            self.runtime.bitness.to_string(),
        ]
    }
}

/// A launched agent, owned by whoever is responsible for reaping it
pub trait AgentProcess: Send {
    /// OS process id; `None` for in-process agents or once reaped
    fn pid(&self) -> Option<u32>;

    /// Forcefully terminate without waiting
    fn start_kill(&mut self);

    /// Ask the agent to exit (SIGTERM for OS processes)
    fn terminate(&mut self) {
        self.start_kill();
    }

    /// Resolve once the agent has exited
    fn wait(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Starts agents; the pool manager is its only caller
pub trait AgentLauncher: Send + Sync {
    fn launch(
        &self,
        bootstrap: &AgentBootstrap,
        launch: &LaunchConfiguration,
    ) -> Result<Box<dyn AgentProcess>>;
}

/// Launches the agent executable as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Default agent executable
    program: PathBuf,

    /// Arguments placed before the bootstrap arguments
    args: Vec<String>,

    /// Executables keyed by runtime key
    runtimes: HashMap<String, PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            runtimes: HashMap::new(),
        }
    }

    /// Build a launcher from configuration, defaulting to the running executable
    pub fn from_config(config: &AgentProgramConfig) -> Result<Self> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        Ok(Self {
            program,
            args: config.args.clone(),
            runtimes: config.runtimes.clone(),
        })
    }

    /// Register an executable for one runtime target
    pub fn with_runtime(mut self, runtime: &RuntimeTarget, program: impl Into<PathBuf>) -> Self {
        self.runtimes.insert(runtime.key(), program.into());
        self
    }

    /// Executable for a runtime: exact key, then framework alone, then the default
    pub fn program_for(&self, runtime: &RuntimeTarget) -> &Path {
        self.runtimes
            .get(&runtime.key())
            .or_else(|| self.runtimes.get(&runtime.framework))
            .unwrap_or(&self.program)
    }
}

impl AgentLauncher for ProcessLauncher {
    fn launch(
        &self,
        bootstrap: &AgentBootstrap,
        launch: &LaunchConfiguration,
    ) -> Result<Box<dyn AgentProcess>> {
        let program = self.program_for(&launch.runtime);

        debug!(
            agent_id = %bootstrap.agent_id,
            runtime = %launch.runtime,
            "Spawning agent process: {:?}",
            program
        );

        let mut command = Command::new(program);
        command
            .args(&self.args)
            .args(bootstrap.to_args())
            .args(&launch.extra_args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("{}: {}", program.display(), e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(bootstrap.agent_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(bootstrap.agent_id, "stderr", stderr));
        }

        info!(agent_id = %bootstrap.agent_id, pid = ?child.id(), "Agent process spawned");

        Ok(Box::new(ChildProcess {
            agent_id: bootstrap.agent_id,
            child,
        }))
    }
}

/// Re-emit an agent's output as log lines tagged with its id
async fn forward_output<R>(agent_id: AgentId, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(agent_id = %agent_id, stream, "{}", line);
    }
}

/// An agent running as an OS child process
pub struct ChildProcess {
    agent_id: AgentId,
    child: Child,
}

impl AgentProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(agent_id = %self.agent_id, "kill skipped: {}", e);
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };

        debug!(agent_id = %self.agent_id, "Sending SIGTERM to PID {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(agent_id = %self.agent_id, "Failed to send SIGTERM: {}", e);
            self.start_kill();
        }
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let status = self.child.wait().await?;
            debug!(agent_id = %self.agent_id, "Agent process exited with status: {}", status);
            Ok(())
        })
    }
}

type AgentTaskFn = dyn Fn(AgentBootstrap, LaunchConfiguration) -> BoxFuture<'static, ()> + Send + Sync;

/// Runs each agent as a task on the current runtime
#[derive(Clone)]
pub struct TaskLauncher {
    spawn: Arc<AgentTaskFn>,
}

impl TaskLauncher {
    pub fn new<F, Fut>(agent: F) -> Self
    where
        F: Fn(AgentBootstrap, LaunchConfiguration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            spawn: Arc::new(move |bootstrap, launch| {
                Box::pin(agent(bootstrap, launch)) as BoxFuture<'static, ()>
            }),
        }
    }

    /// In-process agents running the regular agent loop
    pub fn in_process() -> Self {
        Self::new(|bootstrap, _launch| async move {
            let agent_id = bootstrap.agent_id;
            if let Err(e) = crate::agent::run_agent(bootstrap).await {
                warn!(agent_id = %agent_id, "in-process agent stopped: {}", e);
            }
        })
    }
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher").finish_non_exhaustive()
    }
}

impl AgentLauncher for TaskLauncher {
    fn launch(
        &self,
        bootstrap: &AgentBootstrap,
        launch: &LaunchConfiguration,
    ) -> Result<Box<dyn AgentProcess>> {
        let task = tokio::spawn((self.spawn)(bootstrap.clone(), launch.clone()));
        debug!(agent_id = %bootstrap.agent_id, "In-process agent started");
        Ok(Box::new(TaskProcess { task: Some(task) }))
    }
}

/// An in-process agent task
pub struct TaskProcess {
    task: Option<JoinHandle<()>>,
}

impl AgentProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn start_kill(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(task) = self.task.as_mut() {
                // an aborted task still counts as exited
                let _ = task.await;
            }
            self.task = None;
            Ok(())
        })
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        self.start_kill();
    }
}

/// Graceful stop: let the agent exit on its own, then signal, then kill.
///
/// Each phase is bounded by `grace`.
pub async fn stop_process(mut process: Box<dyn AgentProcess>, grace: Duration) {
    if tokio::time::timeout(grace, process.wait()).await.is_ok() {
        return;
    }

    process.terminate();
    if tokio::time::timeout(grace, process.wait()).await.is_ok() {
        return;
    }

    warn!(pid = ?process.pid(), "Agent still alive after {:?}, killing", grace);
    kill_process(process).await;
}

/// Forcefully terminate and reap
pub async fn kill_process(mut process: Box<dyn AgentProcess>) {
    process.start_kill();
    match tokio::time::timeout(REAP_TIMEOUT, process.wait()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(pid = ?process.pid(), "Error waiting for agent process: {}", e),
        Err(_) => warn!(pid = ?process.pid(), "Agent process was not reaped in time"),
    }
}

/// Kill from a synchronous context (drop paths)
pub(crate) fn kill_detached(process: Box<dyn AgentProcess>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(kill_process(process));
        }
        Err(_) => {
            let mut process = process;
            process.start_kill();
        }
    }
}
