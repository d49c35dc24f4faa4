// src/engine.rs
//! Engine facade
//!
//! The single entry point callers use: submit runs, cancel them, watch
//! events, and shut the whole thing down. It wires the agency, the pool and
//! the dispatcher together and keeps track of the runs in flight.

use crate::model::{AgentId, RequestId, RunEvent, RunRequest, TestFilter, TestPackage};
use crate::runtime::agency::{Agency, AgentSnapshot};
use crate::runtime::agent_pool::{AgentPool, AgentPoolConfig, PoolStats};
use crate::runtime::dispatcher::{DispatchedRun, Dispatcher, RunEvents};
use crate::runtime::process_manager::{AgentLauncher, ProcessLauncher};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Extra time allowed after the cancel grace when cancelling runs at shutdown
const CANCEL_SLACK: Duration = Duration::from_secs(1);

/// Cheap to clone; all clones drive the same engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    agency: Arc<Agency>,
    pool: Arc<AgentPool>,
    dispatcher: Dispatcher,
    runs: DashMap<RequestId, RunControl>,
    accepting: AtomicBool,
    events: broadcast::Sender<RunEvent>,
    stopped: OnceCell<()>,
}

/// Bookkeeping for one in-flight run
struct RunControl {
    agent_id: AgentId,
    cancel: CancellationToken,

    /// Cancelled once the run's relay has finished
    finished: CancellationToken,
}

impl Engine {
    /// Start an engine that launches agents as OS processes
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let launcher = ProcessLauncher::from_config(&config.agent)?;
        Self::with_launcher(config, Arc::new(launcher)).await
    }

    /// Start an engine with a custom agent launcher
    pub async fn with_launcher(
        config: EngineConfig,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Result<Self> {
        config.validate()?;

        let (agency, notices) = Agency::bind(config.agency.clone()).await?;
        let pool = AgentPool::start(
            AgentPoolConfig::from_config(&config),
            Arc::clone(&agency),
            launcher,
            notices,
        );
        let (events, _) = broadcast::channel(config.dispatch.event_buffer);
        let dispatcher = Dispatcher::new(Arc::clone(&pool), config.dispatch.clone(), events.clone());

        info!(endpoint = %agency.endpoint(), "Engine started");

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                agency,
                pool,
                dispatcher,
                runs: DashMap::new(),
                accepting: AtomicBool::new(true),
                events,
                stopped: OnceCell::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Submit a run, waiting up to the dispatch timeout for an agent
    pub async fn submit_run(&self, package: TestPackage, filter: TestFilter) -> Result<RunHandle> {
        let request = self.admit(package, filter)?;
        let run = self.inner.dispatcher.dispatch(request).await?;
        Ok(self.track(run))
    }

    /// Submit a run only if an agent can take it right away.
    ///
    /// Fails with [`EngineError::PoolExhausted`] when every agent is busy and
    /// the pool is at its maximum.
    pub async fn try_submit_run(
        &self,
        package: TestPackage,
        filter: TestFilter,
    ) -> Result<RunHandle> {
        let request = self.admit(package, filter)?;
        let run = self.inner.dispatcher.try_dispatch(request).await?;
        Ok(self.track(run))
    }

    fn admit(&self, package: TestPackage, filter: TestFilter) -> Result<RunRequest> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        counter!("testrun_runs_submitted_total").increment(1);
        Ok(RunRequest::new(package, filter))
    }

    fn track(&self, run: DispatchedRun) -> RunHandle {
        let DispatchedRun {
            request_id,
            agent_id,
            events,
            cancel,
            task,
        } = run;

        let finished = CancellationToken::new();
        self.inner.runs.insert(
            request_id,
            RunControl {
                agent_id,
                cancel: cancel.clone(),
                finished: finished.clone(),
            },
        );

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(request_id = %request_id, "Run relay failed: {}", e);
            }
            if let Some(inner) = inner.upgrade() {
                inner.runs.remove(&request_id);
            }
            finished.cancel();
        });

        RunHandle {
            request_id,
            agent_id,
            events,
            cancel,
        }
    }

    /// Cancel a run. The run ends with `RunCompleted { outcome: Cancelled }`
    /// whether or not its agent acknowledges.
    pub fn cancel(&self, handle: &RunHandle) {
        self.cancel_request(handle.request_id);
    }

    /// Cancel by request id; returns false if the run is no longer in flight
    pub fn cancel_request(&self, request_id: RequestId) -> bool {
        match self.inner.runs.get(&request_id) {
            Some(run) => {
                info!(request_id = %request_id, agent_id = %run.agent_id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Every relayed event from every run
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    pub fn lookup(&self, agent_id: AgentId) -> Option<AgentSnapshot> {
        self.inner.agency.lookup(agent_id)
    }

    pub fn agency(&self) -> &Arc<Agency> {
        &self.inner.agency
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Runs submitted and not yet finished
    pub fn active_runs(&self) -> usize {
        self.inner.runs.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting runs, let in-flight runs finish within the shutdown
    /// timeout, cancel whatever is left, then stop every agent.
    ///
    /// Safe to call more than once; later calls wait for the first to finish.
    pub async fn shutdown(&self) {
        self.inner
            .stopped
            .get_or_init(|| self.inner.drain_and_stop())
            .await;
    }
}

impl EngineInner {
    fn pending_runs(&self) -> Vec<CancellationToken> {
        self.runs.iter().map(|run| run.finished.clone()).collect()
    }

    async fn drain_and_stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let pending = self.pending_runs();
        info!(runs = pending.len(), "Shutting down engine");

        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(
            timeout,
            futures::future::join_all(pending.iter().map(|run| run.cancelled())),
        )
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.runs.len(),
                "Runs still active after {:?}, cancelling", timeout
            );
            for run in self.runs.iter() {
                run.cancel.cancel();
            }

            let pending = self.pending_runs();
            let grace = self.config.dispatch.cancel_grace() + CANCEL_SLACK;
            if tokio::time::timeout(
                grace,
                futures::future::join_all(pending.iter().map(|run| run.cancelled())),
            )
            .await
            .is_err()
            {
                warn!("Cancelled runs did not wind down in time");
            }
        }

        self.pool.shutdown().await;
        self.agency.shutdown().await;
        info!("Engine stopped");
    }
}

/// A submitted run: its identity, its events, and a way to cancel it
pub struct RunHandle {
    request_id: RequestId,
    agent_id: AgentId,
    events: RunEvents,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The agent serving this run
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Next event; `None` once the terminal event has been delivered
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Same as [`Engine::cancel`]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_events(self) -> RunEvents {
        self.events
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("request_id", &self.request_id)
            .field("agent_id", &self.agent_id)
            .field("done", &self.events.is_done())
            .finish()
    }
}
