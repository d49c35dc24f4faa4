// src/runtime/agent_pool.rs
//! Agent pool: how many agents exist, and which one serves a run
//!
//! Agents are expensive to start, so ready agents are reused across runs
//! whose launch configuration matches. When none is free the pool starts a
//! new one (up to the maximum) and the requester waits for its handshake.
//!
//! # Architecture
//!
//! ```text
//! AgentPool
//! ├─ acquire(): claim ready ─► reserve slot + spawn ─► wait for release
//! ├─ AgentLease: release() | discard() | Drop (discard)
//! └─ supervisor task
//!    ├─ transport lost  → fault agent, synthesize AgentFaulted for its run
//!    ├─ every tick      → retire idle agents above the minimum, top up to it
//!    └─ heartbeat tick  → ping connected agents, fault the silent ones
//! ```

use crate::model::{AgentId, LaunchConfiguration, ProcessIsolation, RunEvent, RuntimeTarget};
use crate::protocol::envelope::{Envelope, MessageKind};
use crate::protocol::transport::Transport;
use crate::runtime::agency::{Agency, AgencyNotice, DepartedAgent, RunBinding, Slot, StopTicket};
use crate::runtime::agent_runtime::AgentHandle;
use crate::runtime::process_manager::{kill_process, stop_process, AgentLauncher};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use metrics::{counter, gauge, histogram};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the agent pool
#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    /// Agents kept alive even when idle (default: 0)
    pub min_agents: usize,

    /// Hard cap on live agents (default: 4)
    pub max_agents: usize,

    /// How long `acquire` waits for an agent (default: 30s)
    pub dispatch_timeout: Duration,

    /// Bound on launch-to-ready (default: 10s)
    pub handshake_timeout: Duration,

    /// Idle time before agents above the minimum are retired (default: 60s)
    pub idle_timeout: Duration,

    /// Supervisor tick (default: 1s)
    pub reap_interval: Duration,

    /// Time a stopping agent gets per shutdown phase (default: 2s)
    pub stop_grace: Duration,

    /// Ping period; `None` disables heartbeats (default)
    pub heartbeat_interval: Option<Duration>,

    /// Silence after which a connected agent is faulted (default: 15s)
    pub heartbeat_timeout: Duration,

    /// Launch configuration used to keep the minimum warm
    pub default_launch: LaunchConfiguration,
}

impl AgentPoolConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        let pool = &config.pool;
        Self {
            min_agents: pool.min_agents,
            max_agents: pool.max_agents,
            dispatch_timeout: Duration::from_millis(pool.dispatch_timeout_ms),
            handshake_timeout: config.agency.handshake_timeout(),
            idle_timeout: Duration::from_millis(pool.idle_timeout_ms),
            reap_interval: Duration::from_millis(pool.reap_interval_ms),
            stop_grace: Duration::from_millis(pool.stop_grace_ms),
            heartbeat_interval: pool.heartbeat_interval_ms.map(Duration::from_millis),
            heartbeat_timeout: Duration::from_millis(pool.heartbeat_timeout_ms),
            default_launch: LaunchConfiguration::for_runtime(RuntimeTarget::new(
                config.agent.default_runtime.clone(),
            )),
        }
    }
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live agents (starting, ready or busy)
    pub total_agents: usize,
    pub available_agents: usize,
    pub busy_agents: usize,
    pub starting_agents: usize,
    pub stopping_agents: usize,
    pub max_agents: usize,
}

/// Agent pool for efficient process reuse
pub struct AgentPool {
    config: AgentPoolConfig,
    agency: Arc<Agency>,
    launcher: Arc<dyn AgentLauncher>,

    /// Signalled whenever an agent may have become available
    released: Notify,

    shutdown: CancellationToken,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AgentPool {
    /// Create the pool and start its supervisor
    pub fn start(
        config: AgentPoolConfig,
        agency: Arc<Agency>,
        launcher: Arc<dyn AgentLauncher>,
        notices: mpsc::UnboundedReceiver<AgencyNotice>,
    ) -> Arc<Self> {
        info!(
            min = config.min_agents,
            max = config.max_agents,
            "Initializing agent pool"
        );

        let pool = Arc::new(Self {
            config,
            agency,
            launcher,
            released: Notify::new(),
            shutdown: CancellationToken::new(),
            supervisor: parking_lot::Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(&pool),
            notices,
            pool.shutdown.clone(),
            pool.config.reap_interval,
            pool.config.heartbeat_interval,
        ));
        *pool.supervisor.lock() = Some(supervisor);

        pool
    }

    pub fn config(&self) -> &AgentPoolConfig {
        &self.config
    }

    pub fn agency(&self) -> &Arc<Agency> {
        &self.agency
    }

    /// Bind an agent to a run, starting one if needed and waiting up to the
    /// dispatch timeout for one to become free
    pub async fn acquire(
        self: &Arc<Self>,
        launch: &LaunchConfiguration,
        binding: RunBinding,
    ) -> Result<AgentLease> {
        let deadline = Instant::now() + self.config.dispatch_timeout;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(EngineError::ShuttingDown);
            }

            // register interest before looking, so a release in between is not missed
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(lease) = self.try_claim(launch, &binding).await? {
                return Ok(lease);
            }

            debug!(request_id = %binding.request_id, "All agents busy, waiting");
            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep_until(deadline) => {
                    counter!("testrun_dispatch_timeouts_total").increment(1);
                    return Err(EngineError::DispatchTimeout(self.config.dispatch_timeout));
                }
                _ = self.shutdown.cancelled() => return Err(EngineError::ShuttingDown),
            }
        }
    }

    /// Like `acquire`, but fails with `PoolExhausted` instead of waiting
    pub async fn try_acquire(
        self: &Arc<Self>,
        launch: &LaunchConfiguration,
        binding: RunBinding,
    ) -> Result<AgentLease> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        self.try_claim(launch, &binding)
            .await?
            .ok_or(EngineError::PoolExhausted)
    }

    async fn try_claim(
        self: &Arc<Self>,
        launch: &LaunchConfiguration,
        binding: &RunBinding,
    ) -> Result<Option<AgentLease>> {
        if let Some((agent_id, transport)) = self.agency.claim_ready(launch, binding) {
            debug!(agent_id = %agent_id, request_id = %binding.request_id, "Acquired agent from pool");
            return Ok(Some(self.lease(agent_id, transport, launch.isolation)));
        }

        let agent_id = match self.agency.reserve_slot(launch, self.config.max_agents, true) {
            Slot::Reserved { agent_id, evicted } => {
                if let Some(ticket) = evicted {
                    info!(agent_id = %ticket.agent_id, "Retiring idle agent with a different launch configuration");
                    self.spawn_stop(ticket);
                }
                agent_id
            }
            Slot::Full => return Ok(None),
        };

        self.start_agent(agent_id, launch).await?;

        let bound = self
            .agency
            .mark_busy(agent_id, binding.clone())
            .and_then(|()| {
                self.agency
                    .transport(agent_id)
                    .ok_or(EngineError::ChannelClosed)
            });

        match bound {
            Ok(transport) => Ok(Some(self.lease(agent_id, transport, launch.isolation))),
            Err(e) => {
                self.discard(agent_id, &format!("agent lost before binding: {}", e));
                Err(EngineError::AgentStartupFailure {
                    agent_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn lease(
        self: &Arc<Self>,
        agent_id: AgentId,
        transport: Arc<Transport>,
        isolation: ProcessIsolation,
    ) -> AgentLease {
        self.update_gauges();
        AgentLease {
            agent_id,
            transport,
            isolation,
            pool: Arc::clone(self),
            settled: false,
        }
    }

    /// Launch an agent for a reserved slot and wait for its handshake
    async fn start_agent(&self, agent_id: AgentId, launch: &LaunchConfiguration) -> Result<()> {
        counter!("testrun_agents_spawned_total").increment(1);

        let spawned = AgentHandle::spawn(
            self.launcher.as_ref(),
            Arc::clone(&self.agency),
            agent_id,
            launch,
        );

        let mut handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!(agent_id = %agent_id, "Failed to spawn agent: {}", e);
                self.agency.fault(agent_id, &e.to_string());
                return Err(self.startup_failed(agent_id, e.to_string()));
            }
        };

        if !handle.wait_for_ready(self.config.handshake_timeout).await {
            let reason = handle
                .failure()
                .unwrap_or("handshake did not complete")
                .to_string();
            return Err(self.startup_failed(agent_id, reason));
        }

        histogram!("testrun_agent_startup_seconds").record(handle.elapsed().as_secs_f64());
        handle.adopt();
        info!(agent_id = %agent_id, runtime = %launch.runtime, "Agent started");
        Ok(())
    }

    fn startup_failed(&self, agent_id: AgentId, reason: String) -> EngineError {
        counter!("testrun_agent_startup_failures_total").increment(1);
        self.update_gauges();
        // the slot is free again
        self.released.notify_waiters();
        EngineError::AgentStartupFailure { agent_id, reason }
    }

    /// Return an agent after its run finished cleanly
    pub fn release(self: &Arc<Self>, agent_id: AgentId, isolation: ProcessIsolation) {
        match isolation {
            ProcessIsolation::Shared => {
                if let Err(e) = self.agency.mark_ready(agent_id) {
                    debug!(agent_id = %agent_id, "Agent not returned to pool: {}", e);
                } else {
                    debug!(agent_id = %agent_id, "Released agent back to pool");
                }
            }
            ProcessIsolation::PerRun => self.retire(agent_id),
        }
        self.update_gauges();
        self.released.notify_waiters();
    }

    /// Remove a failed agent; its bound run, if any, gets an `AgentFaulted`
    pub fn discard(self: &Arc<Self>, agent_id: AgentId, reason: &str) {
        let Some(departed) = self.agency.fault(agent_id, reason) else {
            return;
        };

        counter!("testrun_agent_faults_total").increment(1);
        self.dispose(departed, reason);
        self.update_gauges();
        self.released.notify_waiters();
    }

    fn dispose(&self, departed: DepartedAgent, reason: &str) {
        let DepartedAgent {
            agent_id,
            binding,
            process,
            transport,
            ..
        } = departed;

        if let Some(binding) = binding {
            let event = RunEvent::faulted(binding.request_id, agent_id, reason);
            tokio::spawn(async move {
                let _ = binding.route.send(event).await;
            });
        }

        tokio::spawn(async move {
            if let Some(transport) = transport {
                transport.close().await;
            }
            if let Some(process) = process {
                kill_process(process).await;
            }
        });
    }

    /// Gracefully stop an agent in the background
    pub fn retire(self: &Arc<Self>, agent_id: AgentId) {
        if let Some(ticket) = self.agency.begin_stop(agent_id) {
            self.spawn_stop(ticket);
        }
    }

    fn spawn_stop(self: &Arc<Self>, ticket: StopTicket) {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.stop_agent(ticket).await });
    }

    async fn stop_agent(&self, ticket: StopTicket) {
        let StopTicket {
            agent_id,
            transport,
            process,
            binding,
        } = ticket;

        if let Some(binding) = binding {
            let _ = binding
                .route
                .send(RunEvent::faulted(binding.request_id, agent_id, "agent stopped"))
                .await;
        }

        if let Some(transport) = &transport {
            let stop = Envelope::signal(agent_id.as_ulid(), MessageKind::Stop);
            if let Err(e) = transport.send(&stop).await {
                debug!(agent_id = %agent_id, "Stop not delivered: {}", e);
            }
        }

        if let Some(process) = process {
            stop_process(process, self.config.stop_grace).await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }

        self.agency.remove(agent_id);
        counter!("testrun_agents_retired_total").increment(1);
        info!(agent_id = %agent_id, "Agent stopped");

        self.update_gauges();
        self.released.notify_waiters();
    }

    /// Retire ready agents above the minimum that have idled too long
    fn retire_idle(self: &Arc<Self>) {
        let live = self.agency.counts().live();
        let surplus = live.saturating_sub(self.config.min_agents);
        if surplus == 0 {
            return;
        }

        for agent_id in self
            .agency
            .idle_ready(self.config.idle_timeout)
            .into_iter()
            .take(surplus)
        {
            debug!(agent_id = %agent_id, "Retiring idle agent");
            self.retire(agent_id);
        }
    }

    /// Start agents until the minimum is live
    fn top_up(self: &Arc<Self>) {
        let live = self.agency.counts().live();
        for _ in live..self.config.min_agents {
            let launch = self.config.default_launch.clone();
            let agent_id = match self
                .agency
                .reserve_slot(&launch, self.config.max_agents, false)
            {
                Slot::Reserved { agent_id, .. } => agent_id,
                Slot::Full => break,
            };

            let pool = Arc::clone(self);
            tokio::spawn(async move {
                match pool.start_agent(agent_id, &launch).await {
                    Ok(()) => {
                        pool.agency.unreserve(agent_id);
                        pool.update_gauges();
                        pool.released.notify_waiters();
                    }
                    Err(e) => warn!("Failed to warm agent: {}", e),
                }
            });
        }
    }

    /// Ping connected agents and fault the ones that stopped answering
    async fn heartbeat(self: &Arc<Self>) {
        let interval = self.config.heartbeat_interval.unwrap_or(self.config.reap_interval);

        for (agent_id, transport) in self.agency.connected_agents() {
            let ping = Envelope::signal(agent_id.as_ulid(), MessageKind::Ping);
            if tokio::time::timeout(interval, transport.send(&ping)).await.is_err() {
                debug!(agent_id = %agent_id, "Ping send timed out");
            }
        }

        for agent_id in self.agency.stale(self.config.heartbeat_timeout) {
            let reason = format!(
                "no heartbeat within {:?}",
                self.config.heartbeat_timeout
            );
            self.discard(agent_id, &reason);
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let counts = self.agency.counts();
        PoolStats {
            total_agents: counts.live(),
            available_agents: counts.ready,
            busy_agents: counts.busy,
            starting_agents: counts.starting,
            stopping_agents: counts.stopping,
            max_agents: self.config.max_agents,
        }
    }

    fn update_gauges(&self) {
        let counts = self.agency.counts();
        gauge!("testrun_agents_live").set(counts.live() as f64);
        gauge!("testrun_agents_busy").set(counts.busy as f64);
    }

    /// Stop the supervisor and every agent
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }

        let stops: Vec<_> = self
            .agency
            .live_agents()
            .into_iter()
            .filter_map(|agent| self.agency.begin_stop(agent.agent_id))
            .map(|ticket| self.stop_agent(ticket))
            .collect();

        info!(agents = stops.len(), "Shutting down agent pool");
        futures::future::join_all(stops).await;
        self.released.notify_waiters();
    }
}

async fn supervise(
    pool: Weak<AgentPool>,
    mut notices: mpsc::UnboundedReceiver<AgencyNotice>,
    shutdown: CancellationToken,
    reap_interval: Duration,
    heartbeat_interval: Option<Duration>,
) {
    let mut reap = tokio::time::interval(reap_interval);
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut heartbeat = heartbeat_interval.map(|period| {
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            notice = notices.recv() => {
                let Some(AgencyNotice::TransportLost { agent_id, reason }) = notice else {
                    break;
                };
                let Some(pool) = pool.upgrade() else { break };
                pool.discard(agent_id, &reason);
            }
            _ = reap.tick() => {
                let Some(pool) = pool.upgrade() else { break };
                pool.retire_idle();
                pool.top_up();
            }
            _ = async {
                match heartbeat.as_mut() {
                    Some(heartbeat) => {
                        heartbeat.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let Some(pool) = pool.upgrade() else { break };
                pool.heartbeat().await;
            }
        }
    }

    debug!("Pool supervisor stopped");
}

/// Exclusive use of one busy agent for one run.
///
/// Settle it with [`release`](Self::release) or [`discard`](Self::discard);
/// a lease dropped unsettled discards its agent.
pub struct AgentLease {
    agent_id: AgentId,
    transport: Arc<Transport>,
    isolation: ProcessIsolation,
    pool: Arc<AgentPool>,
    settled: bool,
}

impl AgentLease {
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// The run finished; the agent goes back to the pool (or is retired for per-run isolation)
    pub fn release(mut self) {
        self.settled = true;
        self.pool.release(self.agent_id, self.isolation);
    }

    /// The agent cannot be trusted with another run
    pub fn discard(mut self, reason: &str) {
        self.settled = true;
        self.pool.discard(self.agent_id, reason);
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        if !self.settled && tokio::runtime::Handle::try_current().is_ok() {
            self.pool.discard(self.agent_id, "lease dropped while the run was active");
        }
    }
}
