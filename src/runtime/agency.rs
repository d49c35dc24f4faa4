// src/runtime/agency.rs
//! Agency: the listener agents connect back to, and the registry of every
//! live agent
//!
//! # Architecture
//!
//! ```text
//!              accept ──► handshake ──► read loop (one task per agent)
//!                               │              │
//!                               ▼              ▼ run events
//!   Registry (single mutex) ◄── register    binding.route ──► run relay
//!     AgentId → AgentRecord                    │
//!                                              ▼ on close
//!                                   AgencyNotice::TransportLost ──► pool
//! ```
//!
//! Every record moves through
//! `Starting → Connecting → Ready ⇄ Busy → Stopping → Terminated`, and may
//! fall to `Faulted` from any non-terminal state. Terminal records leave the
//! live map at once and are kept in a bounded ring for diagnostics.
//!
//! The registry lock is never held across an await point.

use crate::model::{AgentId, LaunchConfiguration, RequestId, RunEvent};
use crate::protocol::envelope::MessageKind;
use crate::protocol::handshake::{self, HelloFrame};
use crate::protocol::transport::Transport;
use crate::protocol::Hello;
use crate::runtime::process_manager::AgentProcess;
use crate::utils::config::AgencyConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    /// Process launched, no transport yet
    Starting,
    /// Connected; handshake in progress
    Connecting,
    /// Available for dispatch
    Ready,
    /// Bound to exactly one run
    Busy,
    /// Stop sent, exit expected
    Stopping,
    Terminated,
    Faulted,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Terminated | AgentState::Faulted)
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;

        match (*self, next) {
            (from, Faulted) => !from.is_terminal(),
            (Starting, Connecting)
            | (Connecting, Ready)
            | (Ready, Busy)
            | (Busy, Ready)
            | (Starting | Connecting | Ready | Busy, Stopping)
            | (Stopping, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Starting => "starting",
            AgentState::Connecting => "connecting",
            AgentState::Ready => "ready",
            AgentState::Busy => "busy",
            AgentState::Stopping => "stopping",
            AgentState::Terminated => "terminated",
            AgentState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Where a busy agent's run events are delivered
#[derive(Debug, Clone)]
pub struct RunBinding {
    pub request_id: RequestId,
    pub route: mpsc::Sender<RunEvent>,
}

/// Read-only view of an agent record
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub pid: Option<u32>,
    pub launch: LaunchConfiguration,
    pub state: AgentState,
    pub request_id: Option<RequestId>,
    pub spawned_at: DateTime<Utc>,
    pub runs_completed: u64,
    /// Time since the agent was last heard from
    pub heartbeat_age: Option<Duration>,
    /// Why the agent faulted, for departed records
    pub reason: Option<String>,
}

/// Sent to the pool when an agent's connection ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgencyNotice {
    TransportLost { agent_id: AgentId, reason: String },
}

/// Result of asking for room to start a new agent
pub enum Slot {
    /// A `Starting` record was created for the caller
    Reserved {
        agent_id: AgentId,
        /// Idle agent moved to `Stopping` to make room
        evicted: Option<StopTicket>,
    },
    /// The pool is at its maximum
    Full,
}

/// Resources of an agent that has been moved to `Stopping`
pub struct StopTicket {
    pub agent_id: AgentId,
    pub transport: Option<Arc<Transport>>,
    pub process: Option<Box<dyn AgentProcess>>,
    pub binding: Option<RunBinding>,
}

/// Resources of an agent that has left the registry
pub struct DepartedAgent {
    pub agent_id: AgentId,
    pub state: AgentState,
    pub binding: Option<RunBinding>,
    pub process: Option<Box<dyn AgentProcess>>,
    pub transport: Option<Arc<Transport>>,
}

/// Per-state agent counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCounts {
    /// Starting or connecting
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub stopping: usize,
}

impl AgentCounts {
    /// Agents that count toward the pool maximum
    pub fn live(&self) -> usize {
        self.starting + self.ready + self.busy
    }
}

type HandshakeWaiter = oneshot::Sender<std::result::Result<(), String>>;

struct AgentRecord {
    agent_id: AgentId,
    launch: LaunchConfiguration,
    state: AgentState,
    pid: Option<u32>,
    process: Option<Box<dyn AgentProcess>>,
    transport: Option<Arc<Transport>>,
    binding: Option<RunBinding>,
    spawned_at: DateTime<Utc>,
    last_heartbeat: Option<Instant>,
    idle_since: Instant,
    runs_completed: u64,

    /// Held by the starter until it binds the agent itself
    reserved: bool,

    handshake: Option<HandshakeWaiter>,
    reason: Option<String>,
}

impl AgentRecord {
    fn new(agent_id: AgentId, launch: LaunchConfiguration) -> Self {
        Self {
            agent_id,
            launch,
            state: AgentState::Starting,
            pid: None,
            process: None,
            transport: None,
            binding: None,
            spawned_at: Utc::now(),
            last_heartbeat: None,
            idle_since: Instant::now(),
            runs_completed: 0,
            reserved: true,
            handshake: None,
            reason: None,
        }
    }

    fn transition(&mut self, next: AgentState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                agent_id: self.agent_id,
                from: self.state,
                to: next,
            });
        }
        trace!(agent_id = %self.agent_id, from = %self.state, to = %next, "agent state change");
        self.state = next;
        Ok(())
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id,
            pid: self.pid,
            launch: self.launch.clone(),
            state: self.state,
            request_id: self.binding.as_ref().map(|b| b.request_id),
            spawned_at: self.spawned_at,
            runs_completed: self.runs_completed,
            heartbeat_age: self.last_heartbeat.map(|at| at.elapsed()),
            reason: self.reason.clone(),
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, AgentState::Ready | AgentState::Busy)
    }
}

struct Registry {
    agents: HashMap<AgentId, AgentRecord>,
    departed: VecDeque<AgentSnapshot>,
    departed_capacity: usize,
}

impl Registry {
    fn counts(&self) -> AgentCounts {
        let mut counts = AgentCounts::default();
        for record in self.agents.values() {
            match record.state {
                AgentState::Starting | AgentState::Connecting => counts.starting += 1,
                AgentState::Ready => counts.ready += 1,
                AgentState::Busy => counts.busy += 1,
                AgentState::Stopping => counts.stopping += 1,
                AgentState::Terminated | AgentState::Faulted => {}
            }
        }
        counts
    }

    /// Take a record out of the live map, ending in `Faulted` (or
    /// `Terminated` when it was already stopping)
    fn depart(&mut self, agent_id: AgentId, reason: Option<String>) -> Option<DepartedAgent> {
        let mut record = self.agents.remove(&agent_id)?;

        let final_state = if record.state == AgentState::Stopping {
            AgentState::Terminated
        } else {
            AgentState::Faulted
        };
        record.state = final_state;
        record.reason = reason;

        if let Some(waiter) = record.handshake.take() {
            let reason = record
                .reason
                .clone()
                .unwrap_or_else(|| "agent removed before handshake".to_string());
            let _ = waiter.send(Err(reason));
        }

        if self.departed_capacity > 0 {
            if self.departed.len() == self.departed_capacity {
                self.departed.pop_front();
            }
            self.departed.push_back(record.snapshot());
        }

        Some(DepartedAgent {
            agent_id,
            state: final_state,
            binding: record.binding.take(),
            process: record.process.take(),
            transport: record.transport.take(),
        })
    }
}

/// Accepts agent connections and owns every agent record
pub struct Agency {
    config: AgencyConfig,
    endpoint: SocketAddr,
    registry: Mutex<Registry>,
    notices: mpsc::UnboundedSender<AgencyNotice>,
    shutdown: CancellationToken,
}

impl Agency {
    /// Bind the listener and start accepting agents
    pub async fn bind(
        config: AgencyConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<AgencyNotice>)> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let endpoint = listener.local_addr()?;
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let agency = Arc::new(Self {
            registry: Mutex::new(Registry {
                agents: HashMap::new(),
                departed: VecDeque::with_capacity(config.departed_capacity),
                departed_capacity: config.departed_capacity,
            }),
            config,
            endpoint,
            notices,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(
            Arc::downgrade(&agency),
            listener,
            agency.shutdown.clone(),
        ));

        info!(%endpoint, "Agency listening");
        Ok((agency, notices_rx))
    }

    /// Address agents connect back to
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Create a `Starting` record if the pool has room.
    ///
    /// With `evict_mismatched`, a full pool gives up one idle agent whose
    /// launch configuration differs from `launch`.
    pub fn reserve_slot(
        &self,
        launch: &LaunchConfiguration,
        max_agents: usize,
        evict_mismatched: bool,
    ) -> Slot {
        let mut registry = self.registry.lock();

        let mut evicted = None;
        if registry.counts().live() >= max_agents {
            if !evict_mismatched {
                return Slot::Full;
            }

            let victim = registry
                .agents
                .values()
                .filter(|r| r.state == AgentState::Ready && !r.reserved && r.launch != *launch)
                .min_by_key(|r| r.idle_since)
                .map(|r| r.agent_id);

            let Some(victim) = victim else {
                return Slot::Full;
            };
            evicted = Self::stop_locked(&mut registry, victim);
            if evicted.is_none() {
                return Slot::Full;
            }
        }

        let agent_id = AgentId::new();
        registry
            .agents
            .insert(agent_id, AgentRecord::new(agent_id, launch.clone()));

        debug!(agent_id = %agent_id, runtime = %launch.runtime, "slot reserved");
        Slot::Reserved { agent_id, evicted }
    }

    /// Completion signal for the agent's handshake
    pub fn await_handshake(
        &self,
        agent_id: AgentId,
    ) -> Result<oneshot::Receiver<std::result::Result<(), String>>> {
        let mut registry = self.registry.lock();
        let record = registry
            .agents
            .get_mut(&agent_id)
            .ok_or(EngineError::UnknownAgent(agent_id))?;

        let (tx, rx) = oneshot::channel();
        match record.state {
            AgentState::Starting | AgentState::Connecting => record.handshake = Some(tx),
            AgentState::Ready | AgentState::Busy => {
                let _ = tx.send(Ok(()));
            }
            state => {
                return Err(EngineError::InvalidTransition {
                    agent_id,
                    from: state,
                    to: AgentState::Ready,
                })
            }
        }
        Ok(rx)
    }

    pub fn attach_pid(&self, agent_id: AgentId, pid: Option<u32>) {
        if let Some(record) = self.registry.lock().agents.get_mut(&agent_id) {
            record.pid = pid;
        }
    }

    /// Hand ownership of the agent's process to its record.
    ///
    /// The process is given back when the record is already gone.
    pub fn adopt_process(
        &self,
        agent_id: AgentId,
        process: Box<dyn AgentProcess>,
    ) -> Option<Box<dyn AgentProcess>> {
        let mut registry = self.registry.lock();
        match registry.agents.get_mut(&agent_id) {
            Some(record) => {
                record.process = Some(process);
                None
            }
            None => Some(process),
        }
    }

    /// Record a completed handshake: `Connecting → Ready`
    pub fn register(&self, hello: &Hello, transport: Arc<Transport>) -> Result<AgentId> {
        let mut registry = self.registry.lock();
        let record = registry
            .agents
            .get_mut(&hello.agent_id)
            .ok_or(EngineError::UnknownAgent(hello.agent_id))?;

        record.transition(AgentState::Ready)?;
        record.transport = Some(transport);
        record.pid = record.pid.or(Some(hello.pid)).filter(|pid| *pid != 0);
        record.last_heartbeat = Some(Instant::now());
        record.idle_since = Instant::now();

        if let Some(waiter) = record.handshake.take() {
            let _ = waiter.send(Ok(()));
        }

        info!(agent_id = %hello.agent_id, pid = hello.pid, version = %hello.agent_version, "Agent registered");
        Ok(hello.agent_id)
    }

    pub fn lookup(&self, agent_id: AgentId) -> Option<AgentSnapshot> {
        self.registry.lock().agents.get(&agent_id).map(AgentRecord::snapshot)
    }

    /// Bind a ready agent to a run: `Ready → Busy`
    pub fn mark_busy(&self, agent_id: AgentId, binding: RunBinding) -> Result<()> {
        let mut registry = self.registry.lock();
        let record = registry
            .agents
            .get_mut(&agent_id)
            .ok_or(EngineError::UnknownAgent(agent_id))?;

        if let Some(existing) = &record.binding {
            return Err(EngineError::AgentBusy {
                agent_id,
                request_id: existing.request_id,
            });
        }

        record.transition(AgentState::Busy)?;
        record.reserved = false;
        record.binding = Some(binding);
        Ok(())
    }

    /// Return a busy agent to the pool: `Busy → Ready`
    pub fn mark_ready(&self, agent_id: AgentId) -> Result<()> {
        let mut registry = self.registry.lock();
        let record = registry
            .agents
            .get_mut(&agent_id)
            .ok_or(EngineError::UnknownAgent(agent_id))?;

        record.transition(AgentState::Ready)?;
        record.binding = None;
        record.runs_completed += 1;
        record.idle_since = Instant::now();
        Ok(())
    }

    /// Make a freshly started agent available to any caller
    pub fn unreserve(&self, agent_id: AgentId) {
        if let Some(record) = self.registry.lock().agents.get_mut(&agent_id) {
            record.reserved = false;
            record.idle_since = Instant::now();
        }
    }

    /// Atomically pick an idle agent with a matching launch configuration and bind it
    pub fn claim_ready(
        &self,
        launch: &LaunchConfiguration,
        binding: &RunBinding,
    ) -> Option<(AgentId, Arc<Transport>)> {
        let mut registry = self.registry.lock();

        // most recently idle first, so surplus agents age out
        let record = registry
            .agents
            .values_mut()
            .filter(|r| {
                r.state == AgentState::Ready
                    && !r.reserved
                    && r.launch == *launch
                    && r.transport.as_ref().is_some_and(|t| !t.is_closed())
            })
            .max_by_key(|r| r.idle_since)?;

        let transport = record.transport.clone()?;
        record.transition(AgentState::Busy).ok()?;
        record.binding = Some(binding.clone());
        Some((record.agent_id, transport))
    }

    /// Move an agent to `Stopping` and hand its resources to the caller
    pub fn begin_stop(&self, agent_id: AgentId) -> Option<StopTicket> {
        Self::stop_locked(&mut self.registry.lock(), agent_id)
    }

    fn stop_locked(registry: &mut Registry, agent_id: AgentId) -> Option<StopTicket> {
        let record = registry.agents.get_mut(&agent_id)?;
        record.transition(AgentState::Stopping).ok()?;

        if let Some(waiter) = record.handshake.take() {
            let _ = waiter.send(Err("agent stopped before handshake".to_string()));
        }

        Some(StopTicket {
            agent_id,
            transport: record.transport.clone(),
            process: record.process.take(),
            binding: record.binding.take(),
        })
    }

    /// Remove an agent after a failure. A stopping agent ends `Terminated`,
    /// anything else `Faulted`.
    pub fn fault(&self, agent_id: AgentId, reason: &str) -> Option<DepartedAgent> {
        let departed = self
            .registry
            .lock()
            .depart(agent_id, Some(reason.to_string()))?;

        if departed.state == AgentState::Faulted {
            warn!(agent_id = %agent_id, "Agent faulted: {}", reason);
        } else {
            debug!(agent_id = %agent_id, "Stopping agent disconnected: {}", reason);
        }
        Some(departed)
    }

    /// Remove an agent from the live registry
    pub fn remove(&self, agent_id: AgentId) -> Option<DepartedAgent> {
        let departed = self.registry.lock().depart(agent_id, None)?;
        debug!(agent_id = %agent_id, state = %departed.state, "Agent removed");
        Some(departed)
    }

    pub fn transport(&self, agent_id: AgentId) -> Option<Arc<Transport>> {
        self.registry
            .lock()
            .agents
            .get(&agent_id)
            .and_then(|r| r.transport.clone())
    }

    /// Unreserved ready agents idle for at least `idle_for`, oldest first
    pub fn idle_ready(&self, idle_for: Duration) -> Vec<AgentId> {
        let registry = self.registry.lock();
        let mut idle: Vec<_> = registry
            .agents
            .values()
            .filter(|r| {
                r.state == AgentState::Ready && !r.reserved && r.idle_since.elapsed() >= idle_for
            })
            .map(|r| (r.idle_since, r.agent_id))
            .collect();
        idle.sort();
        idle.into_iter().map(|(_, id)| id).collect()
    }

    pub fn counts(&self) -> AgentCounts {
        self.registry.lock().counts()
    }

    pub fn live_agents(&self) -> Vec<AgentSnapshot> {
        self.registry
            .lock()
            .agents
            .values()
            .map(AgentRecord::snapshot)
            .collect()
    }

    /// Agents with a completed handshake and their transports
    pub fn connected_agents(&self) -> Vec<(AgentId, Arc<Transport>)> {
        self.registry
            .lock()
            .agents
            .values()
            .filter(|r| r.is_connected())
            .filter_map(|r| r.transport.clone().map(|t| (r.agent_id, t)))
            .collect()
    }

    /// Connected agents not heard from within `timeout`
    pub fn stale(&self, timeout: Duration) -> Vec<AgentId> {
        self.registry
            .lock()
            .agents
            .values()
            .filter(|r| r.is_connected())
            .filter(|r| r.last_heartbeat.map_or(true, |at| at.elapsed() > timeout))
            .map(|r| r.agent_id)
            .collect()
    }

    /// Recently terminated or faulted agents, oldest first
    pub fn recent_departures(&self) -> Vec<AgentSnapshot> {
        self.registry.lock().departed.iter().cloned().collect()
    }

    /// Stop accepting connections and drop every remaining record
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids: Vec<AgentId> = self.registry.lock().agents.keys().copied().collect();
        for agent_id in ids {
            let Some(departed) = self.remove(agent_id) else {
                continue;
            };
            if let Some(transport) = departed.transport {
                transport.close().await;
            }
            if let Some(process) = departed.process {
                crate::runtime::process_manager::kill_process(process).await;
            }
        }

        info!(endpoint = %self.endpoint, "Agency shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn touch(&self, agent_id: AgentId) {
        if let Some(record) = self.registry.lock().agents.get_mut(&agent_id) {
            record.last_heartbeat = Some(Instant::now());
        }
    }

    /// Route sender for an event, if it belongs to the agent's current run
    fn route_for(&self, agent_id: AgentId, event: &RunEvent) -> Option<mpsc::Sender<RunEvent>> {
        let registry = self.registry.lock();
        let binding = registry.agents.get(&agent_id)?.binding.as_ref()?;
        (binding.request_id == event.request_id() && event.agent_id() == agent_id)
            .then(|| binding.route.clone())
    }

    /// Validate a hello against the record it names: `Starting → Connecting`
    fn begin_handshake(&self, frame: &HelloFrame) -> Result<()> {
        let agent_id = frame.hello.agent_id;
        let mut registry = self.registry.lock();

        let record = registry
            .agents
            .get_mut(&agent_id)
            .ok_or(EngineError::UnknownAgent(agent_id))?;
        if record.state != AgentState::Starting {
            return Err(EngineError::Protocol(format!(
                "agent {} is already {}",
                agent_id, record.state
            )));
        }
        record.transition(AgentState::Connecting)?;

        let verdict = frame.verify().and_then(|()| {
            if frame.hello.runtime == record.launch.runtime {
                Ok(())
            } else {
                Err(EngineError::Protocol(format!(
                    "agent runs {}, launched for {}",
                    frame.hello.runtime, record.launch.runtime
                )))
            }
        });

        if let Err(e) = &verdict {
            registry.depart(agent_id, Some(e.to_string()));
            warn!(agent_id = %agent_id, "Handshake rejected: {}", e);
        }
        verdict
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {}", e);
        }
        let transport = Arc::new(Transport::new(
            stream,
            peer.to_string(),
            self.config.max_frame_bytes,
        ));

        let frame = match handshake::read_hello(&transport, self.config.handshake_timeout()).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, "Handshake failed: {}", e);
                handshake::reject(&transport, ulid::Ulid::nil(), &e.to_string()).await;
                return;
            }
        };

        let agent_id = frame.hello.agent_id;
        if let Err(e) = self.begin_handshake(&frame) {
            handshake::reject(&transport, agent_id.as_ulid(), &e.to_string()).await;
            return;
        }

        if let Err(e) = handshake::welcome(&transport, &frame.hello).await {
            self.fault(agent_id, &format!("welcome not delivered: {}", e));
            transport.close().await;
            return;
        }

        if let Err(e) = self.register(&frame.hello, Arc::clone(&transport)) {
            debug!(agent_id = %agent_id, "Agent gone before registration: {}", e);
            transport.close().await;
            return;
        }

        let weak = Arc::downgrade(&self);
        let shutdown = self.shutdown.clone();
        drop(self);
        read_loop(weak, agent_id, transport, shutdown).await;
    }
}

impl Drop for Agency {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(agency: Weak<Agency>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Some(agency) = agency.upgrade() else {
                    break;
                };
                trace!(%peer, "agent connection accepted");
                tokio::spawn(agency.handle_connection(stream, peer));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!("accept loop stopped");
}

/// Per-agent reader: routes run events to the bound run until the channel closes
async fn read_loop(
    agency: Weak<Agency>,
    agent_id: AgentId,
    transport: Arc<Transport>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break "agency shut down".to_string(),
            received = transport.receive() => received,
        };

        let envelope = match received {
            Ok(envelope) => envelope,
            Err(EngineError::ChannelClosed) => break "agent connection closed".to_string(),
            Err(e) => break e.to_string(),
        };

        let Some(agency) = agency.upgrade() else {
            break "agency dropped".to_string();
        };
        agency.touch(agent_id);

        match envelope.kind {
            MessageKind::Pong => {}
            kind if kind.is_run_event() => {
                let event = match envelope.run_event() {
                    Ok(event) => event,
                    Err(e) => break e.to_string(),
                };
                let route = agency.route_for(agent_id, &event);
                drop(agency);

                match route {
                    Some(route) => {
                        if route.send(event).await.is_err() {
                            debug!(agent_id = %agent_id, "run relay gone, event dropped");
                        }
                    }
                    None => {
                        debug!(agent_id = %agent_id, request_id = %event.request_id(), "dropping event for unbound request")
                    }
                }
            }
            other => {
                warn!(agent_id = %agent_id, "Unexpected {:?} from agent", other);
            }
        }
    };

    transport.close().await;
    if let Some(agency) = agency.upgrade() {
        let _ = agency.notices.send(AgencyNotice::TransportLost { agent_id, reason });
    }
}
