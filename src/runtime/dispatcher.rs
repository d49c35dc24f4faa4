// src/runtime/dispatcher.rs
//! Run dispatcher: binds a run to an agent and relays its events
//!
//! Each dispatched run gets its own relay task. The relay owns the agent's
//! lease for the life of the run, forwards the agent's events in order, and
//! guarantees the caller sees exactly one terminal event, whether the run
//! completes, the agent dies, or the run is cancelled.

use crate::model::{AgentId, RequestId, RunEvent, RunOutcome, RunRequest, RunSummary};
use crate::protocol::envelope::{Envelope, MessageKind, RunCommand};
use crate::runtime::agency::RunBinding;
use crate::runtime::agent_pool::{AgentLease, AgentPool};
use crate::utils::config::DispatchConfig;
use crate::utils::errors::Result;
use futures::Stream;
use metrics::counter;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    pool: Arc<AgentPool>,
    config: DispatchConfig,
    broadcast: broadcast::Sender<RunEvent>,
}

/// A run bound to an agent
pub struct DispatchedRun {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub events: RunEvents,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<AgentPool>,
        config: DispatchConfig,
        broadcast: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self {
            pool,
            config,
            broadcast,
        }
    }

    /// Wait for an agent (up to the dispatch timeout) and start the run
    pub async fn dispatch(&self, request: RunRequest) -> Result<DispatchedRun> {
        self.start(request, true).await
    }

    /// Start the run only if an agent is available right away
    pub async fn try_dispatch(&self, request: RunRequest) -> Result<DispatchedRun> {
        self.start(request, false).await
    }

    async fn start(&self, request: RunRequest, wait: bool) -> Result<DispatchedRun> {
        let request_id = request.request_id;
        let command = Envelope::new(
            request_id.as_ulid(),
            MessageKind::Run,
            &RunCommand {
                request_id,
                package: request.package,
                filter: request.filter,
            },
        )?;

        let (route, inbound) = mpsc::channel(self.config.event_buffer);
        let binding = RunBinding { request_id, route };

        let lease = if wait {
            self.pool.acquire(&request.launch, binding).await?
        } else {
            self.pool.try_acquire(&request.launch, binding).await?
        };
        let agent_id = lease.agent_id();
        info!(request_id = %request_id, agent_id = %agent_id, "Run dispatched");
        counter!("testrun_runs_dispatched_total").increment(1);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let relay = RunRelay {
            command,
            inbound,
            sink: EventSink::new(request_id, agent_id, tx, self.broadcast.clone()),
            cancel: cancel.clone(),
            cancel_grace: self.config.cancel_grace(),
        };
        let task = tokio::spawn(relay.run(lease));

        Ok(DispatchedRun {
            request_id,
            agent_id,
            events: RunEvents::new(rx),
            cancel,
            task,
        })
    }
}

/// How the relay leaves the agent when the run is over
enum Settle {
    Release,
    Discard(String),
}

struct RunRelay {
    command: Envelope,
    inbound: mpsc::Receiver<RunEvent>,
    sink: EventSink,
    cancel: CancellationToken,
    cancel_grace: Duration,
}

impl RunRelay {
    async fn run(mut self, lease: AgentLease) {
        let settle = self.drive(&lease).await;
        match settle {
            Settle::Release => lease.release(),
            Settle::Discard(reason) => lease.discard(&reason),
        }
    }

    async fn drive(&mut self, lease: &AgentLease) -> Settle {
        if let Err(e) = lease.transport().send(&self.command).await {
            let reason = format!("run command not delivered: {}", e);
            self.sink.fault(&reason);
            return Settle::Discard(reason);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(lease).await,
                event = self.inbound.recv() => match event {
                    Some(event) => {
                        let settle = match &event {
                            RunEvent::RunCompleted { .. } => Some(Settle::Release),
                            RunEvent::AgentFaulted { reason, .. } => {
                                Some(Settle::Discard(reason.clone()))
                            }
                            _ => None,
                        };
                        self.sink.emit(event);
                        if let Some(settle) = settle {
                            return settle;
                        }
                    }
                    None => {
                        let reason = "agent connection lost".to_string();
                        self.sink.fault(&reason);
                        return Settle::Discard(reason);
                    }
                },
            }
        }
    }

    /// Report the run cancelled at once, then give the agent the grace
    /// period to acknowledge before giving up on it
    async fn cancelled(&mut self, lease: &AgentLease) -> Settle {
        let request_id = self.sink.request_id;
        debug!(request_id = %request_id, "Cancelling run");
        self.sink.complete(RunOutcome::Cancelled);

        let grace = tokio::time::sleep(self.cancel_grace);
        tokio::pin!(grace);

        let cancel = Envelope::signal(request_id.as_ulid(), MessageKind::Cancel);
        tokio::select! {
            _ = &mut grace => return Settle::Discard("cancel not delivered in time".to_string()),
            sent = lease.transport().send(&cancel) => {
                if let Err(e) = sent {
                    return Settle::Discard(format!("cancel not delivered: {}", e));
                }
            }
        }

        loop {
            tokio::select! {
                _ = &mut grace => {
                    warn!(request_id = %request_id, agent_id = %lease.agent_id(), "Agent did not acknowledge cancellation");
                    return Settle::Discard(format!(
                        "cancellation not acknowledged within {:?}",
                        self.cancel_grace
                    ));
                }
                event = self.inbound.recv() => match event {
                    Some(RunEvent::RunCompleted { .. }) => return Settle::Release,
                    Some(RunEvent::AgentFaulted { reason, .. }) => return Settle::Discard(reason),
                    Some(_) => {}
                    None => return Settle::Discard("agent connection lost during cancellation".to_string()),
                },
            }
        }
    }
}

/// Delivers a run's events to its caller and to global subscribers,
/// emitting exactly one terminal event
struct EventSink {
    request_id: RequestId,
    agent_id: AgentId,
    tx: mpsc::UnboundedSender<RunEvent>,
    broadcast: broadcast::Sender<RunEvent>,
    summary: RunSummary,
    finished: bool,
}

impl EventSink {
    fn new(
        request_id: RequestId,
        agent_id: AgentId,
        tx: mpsc::UnboundedSender<RunEvent>,
        broadcast: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self {
            request_id,
            agent_id,
            tx,
            broadcast,
            summary: RunSummary::default(),
            finished: false,
        }
    }

    fn emit(&mut self, event: RunEvent) {
        if self.finished {
            return;
        }

        match &event {
            RunEvent::TestCaseResult { result, .. } => self.summary.record(result),
            RunEvent::RunCompleted { outcome, .. } => {
                let outcome = match outcome {
                    RunOutcome::Finished => "finished",
                    RunOutcome::Cancelled => "cancelled",
                };
                counter!("testrun_runs_completed_total", "outcome" => outcome).increment(1);
            }
            RunEvent::AgentFaulted { .. } => {
                counter!("testrun_runs_completed_total", "outcome" => "faulted").increment(1);
            }
            _ => {}
        }

        self.finished = event.is_terminal();
        // no subscribers is fine
        let _ = self.broadcast.send(event.clone());
        let _ = self.tx.send(event);
    }

    fn fault(&mut self, reason: &str) {
        self.emit(RunEvent::faulted(self.request_id, self.agent_id, reason));
    }

    fn complete(&mut self, outcome: RunOutcome) {
        self.emit(RunEvent::RunCompleted {
            request_id: self.request_id,
            agent_id: self.agent_id,
            summary: self.summary.clone(),
            outcome,
        });
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if !self.finished {
            self.fault("run relay stopped before the run completed");
        }
    }
}

/// A run's event sequence; ends after its terminal event
pub struct RunEvents {
    rx: mpsc::UnboundedReceiver<RunEvent>,
    done: bool,
}

impl RunEvents {
    fn new(rx: mpsc::UnboundedReceiver<RunEvent>) -> Self {
        Self { rx, done: false }
    }

    pub async fn recv(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        self.done = event.as_ref().map_or(true, RunEvent::is_terminal);
        event
    }

    /// Drain the remaining events, terminal event included
    pub async fn collect_all(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Stream for RunEvents {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        if self.done {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(event) = &polled {
            self.done = event.as_ref().map_or(true, RunEvent::is_terminal);
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LaunchConfiguration, TestFilter, TestOutcome, TestPackage};
    use crate::runtime::agency::Agency;
    use crate::runtime::agent_pool::AgentPoolConfig;
    use crate::runtime::process_manager::TaskLauncher;
    use crate::runtime::test_support;
    use crate::utils::config::AgencyConfig;
    use futures::StreamExt;

    async fn dispatcher(launcher: TaskLauncher, cancel_grace_ms: u64) -> Dispatcher {
        let (agency, notices) = Agency::bind(AgencyConfig::default()).await.unwrap();
        let pool = AgentPool::start(
            AgentPoolConfig {
                max_agents: 2,
                dispatch_timeout: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(2),
                reap_interval: Duration::from_millis(20),
                stop_grace: Duration::from_millis(100),
                default_launch: LaunchConfiguration::default(),
                ..Default::default()
            },
            agency,
            Arc::new(launcher),
            notices,
        );
        let (broadcast, _) = broadcast::channel(64);
        Dispatcher::new(
            pool,
            DispatchConfig {
                cancel_grace_ms,
                event_buffer: 16,
            },
            broadcast,
        )
    }

    fn empty_request() -> RunRequest {
        RunRequest::new(TestPackage::new(vec![]), TestFilter::empty())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_package_round_trip() {
        let dispatcher = dispatcher(TaskLauncher::in_process(), 1_000).await;
        let run = dispatcher.dispatch(empty_request()).await.unwrap();
        let request_id = run.request_id;

        let events = run.events.collect_all().await;
        assert!(matches!(
            events.first(),
            Some(RunEvent::Started { test_count: 0, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunCompleted { outcome: RunOutcome::Finished, .. })
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, RunEvent::TestCaseResult { .. })));
        assert!(events.iter().all(|e| e.request_id() == request_id));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_results_relayed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let suite = test_support::write_suite(
            dir.path(),
            "math.json",
            &[
                ("adds", TestOutcome::Passed, 1),
                ("divides", TestOutcome::Failed, 1),
                ("rounds", TestOutcome::Skipped, 1),
            ],
        );

        let dispatcher = dispatcher(TaskLauncher::in_process(), 1_000).await;
        let request = RunRequest::new(TestPackage::new(vec![suite]), TestFilter::empty());
        let run = dispatcher.dispatch(request).await.unwrap();

        let events: Vec<_> = run.events.collect().await;
        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::TestCaseResult { result, .. } => Some(result.name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["adds", "divides", "rounds"]);

        match events.last() {
            Some(RunEvent::RunCompleted { summary, .. }) => {
                assert_eq!(summary.total, 3);
                assert_eq!(summary.failed, 1);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_agent_crash_yields_single_fault() {
        let dispatcher = dispatcher(test_support::crashing_agents(), 1_000).await;
        let run = dispatcher.dispatch(empty_request()).await.unwrap();
        let agent_id = run.agent_id;

        let events = tokio::time::timeout(Duration::from_secs(5), run.events.collect_all())
            .await
            .unwrap();
        assert!(matches!(events.first(), Some(RunEvent::Started { .. })));
        assert!(matches!(events.last(), Some(RunEvent::AgentFaulted { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        run.task.await.unwrap();
        assert!(dispatcher.pool.agency().lookup(agent_id).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unacknowledged_cancel_completes_and_discards() {
        let dispatcher = dispatcher(test_support::deaf_agents(), 200).await;
        let mut run = dispatcher.dispatch(empty_request()).await.unwrap();
        let agent_id = run.agent_id;

        assert!(matches!(run.events.recv().await, Some(RunEvent::Started { .. })));

        let cancelled_at = tokio::time::Instant::now();
        run.cancel.cancel();
        let terminal = run.events.recv().await.unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_millis(200));
        assert!(matches!(
            terminal,
            RunEvent::RunCompleted { outcome: RunOutcome::Cancelled, .. }
        ));
        assert!(run.events.recv().await.is_none());

        run.task.await.unwrap();
        assert!(dispatcher.pool.agency().lookup(agent_id).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledged_cancel_returns_agent() {
        let dir = tempfile::tempdir().unwrap();
        let suite = test_support::write_suite(
            dir.path(),
            "slow.json",
            &[("sleeps", TestOutcome::Passed, 10_000)],
        );

        let dispatcher = dispatcher(TaskLauncher::in_process(), 2_000).await;
        let request = RunRequest::new(TestPackage::new(vec![suite]), TestFilter::empty());
        let mut run = dispatcher.dispatch(request).await.unwrap();
        let agent_id = run.agent_id;

        assert!(matches!(run.events.recv().await, Some(RunEvent::Started { .. })));
        run.cancel.cancel();
        assert!(matches!(
            run.events.recv().await,
            Some(RunEvent::RunCompleted { outcome: RunOutcome::Cancelled, .. })
        ));

        run.task.await.unwrap();
        let snapshot = dispatcher.pool.agency().lookup(agent_id).unwrap();
        assert_eq!(snapshot.state, crate::runtime::agency::AgentState::Ready);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_runs_use_distinct_agents() {
        let dir = tempfile::tempdir().unwrap();
        let suite = test_support::write_suite(
            dir.path(),
            "pause.json",
            &[("waits", TestOutcome::Passed, 200)],
        );
        let package = TestPackage::new(vec![suite]);

        let dispatcher = dispatcher(TaskLauncher::in_process(), 1_000).await;
        let first = dispatcher
            .dispatch(RunRequest::new(package.clone(), TestFilter::empty()))
            .await
            .unwrap();
        let second = dispatcher
            .dispatch(RunRequest::new(package, TestFilter::empty()))
            .await
            .unwrap();
        assert_ne!(first.agent_id, second.agent_id);

        let (a, b) = tokio::join!(first.events.collect_all(), second.events.collect_all());
        for events in [a, b] {
            assert!(matches!(
                events.last(),
                Some(RunEvent::RunCompleted { outcome: RunOutcome::Finished, .. })
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_events_reach_global_subscribers() {
        let dispatcher = dispatcher(TaskLauncher::in_process(), 1_000).await;
        let mut subscriber = dispatcher.broadcast.subscribe();

        let run = dispatcher.dispatch(empty_request()).await.unwrap();
        let request_id = run.request_id;
        run.events.collect_all().await;

        let mut seen = Vec::new();
        while let Ok(event) = subscriber.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().all(|e| e.request_id() == request_id));
        assert!(seen.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_sink_drop_emits_fault() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(4);
        let sink = EventSink::new(RequestId::new(), AgentId::new(), tx, broadcast);
        drop(sink);

        let events = RunEvents::new(rx).collect_all().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RunEvent::AgentFaulted { .. }));
    }

    #[tokio::test]
    async fn test_sink_emits_single_terminal() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(4);
        let mut sink = EventSink::new(RequestId::new(), AgentId::new(), tx, broadcast);

        sink.complete(RunOutcome::Cancelled);
        sink.fault("late");
        sink.complete(RunOutcome::Finished);
        drop(sink);

        let events = RunEvents::new(rx).collect_all().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RunEvent::RunCompleted { outcome: RunOutcome::Cancelled, .. }
        ));
    }
}
