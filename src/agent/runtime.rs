// src/agent/runtime.rs
//! Agent main loop
//!
//! The agent connects back to the agency, completes the handshake, and then
//! serves the connection: one run at a time, pings answered immediately,
//! `cancel` acknowledged with `RunCompleted { outcome: Cancelled }` and
//! `stop` ending the loop.

use crate::agent::executor::plan;
use crate::model::{AgentId, RequestId, RunEvent, RunOutcome, RunSummary};
use crate::protocol::envelope::{Envelope, Hello, MessageKind, RunCommand, PROTOCOL_VERSION};
use crate::protocol::handshake;
use crate::protocol::transport::{Transport, DEFAULT_MAX_FRAME_BYTES};
use crate::runtime::process_manager::AgentBootstrap;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a cancelled run may take to wind down when the agent exits
const WIND_DOWN: Duration = Duration::from_secs(2);

/// Connect to the agency and serve runs until told to stop or the engine goes away
pub async fn run_agent(bootstrap: AgentBootstrap) -> Result<()> {
    let transport = Arc::new(Transport::connect(bootstrap.endpoint, DEFAULT_MAX_FRAME_BYTES).await?);

    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        agent_id: bootstrap.agent_id,
        pid: std::process::id(),
        runtime: bootstrap.runtime.clone(),
        agent_version: crate::VERSION.to_string(),
    };
    if let Err(e) = handshake::offer(&transport, &hello).await {
        transport.close().await;
        return Err(e);
    }
    info!(
        agent_id = %bootstrap.agent_id,
        endpoint = %bootstrap.endpoint,
        runtime = %bootstrap.runtime,
        "Agent connected"
    );

    let mut agent = Agent {
        agent_id: bootstrap.agent_id,
        transport,
        active: None,
    };
    let result = agent.serve().await;
    agent.finish().await;
    result
}

struct ActiveRun {
    request_id: RequestId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Agent {
    agent_id: AgentId,
    transport: Arc<Transport>,
    active: Option<ActiveRun>,
}

impl Agent {
    async fn serve(&mut self) -> Result<()> {
        loop {
            let envelope = match self.transport.receive().await {
                Ok(envelope) => envelope,
                Err(EngineError::ChannelClosed) => {
                    info!(agent_id = %self.agent_id, "Engine closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match envelope.kind {
                MessageKind::Ping => {
                    let pong = Envelope::signal(envelope.correlation_id, MessageKind::Pong);
                    self.transport.send(&pong).await?;
                }
                MessageKind::Run => self.start_run(envelope.payload()?),
                MessageKind::Cancel => {
                    let request_id = RequestId::from(envelope.correlation_id);
                    match &self.active {
                        Some(active) if active.request_id == request_id => {
                            debug!(request_id = %request_id, "Cancelling run");
                            active.cancel.cancel();
                        }
                        _ => debug!(request_id = %request_id, "Cancel for a run that is not active"),
                    }
                }
                MessageKind::Stop => {
                    info!(agent_id = %self.agent_id, "Stop requested");
                    return Ok(());
                }
                other => debug!(agent_id = %self.agent_id, "Ignoring {:?}", other),
            }
        }
    }

    fn start_run(&mut self, command: RunCommand) {
        if let Some(active) = &self.active {
            if !active.task.is_finished() {
                warn!(
                    active = %active.request_id,
                    rejected = %command.request_id,
                    "Run received while another is active"
                );
                return;
            }
        }

        let request_id = command.request_id;
        let cancel = CancellationToken::new();
        let reporter = Reporter {
            transport: Arc::clone(&self.transport),
            request_id,
            agent_id: self.agent_id,
        };
        let task = tokio::spawn(execute(reporter, command, cancel.clone()));

        self.active = Some(ActiveRun {
            request_id,
            cancel,
            task,
        });
    }

    async fn finish(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.cancel.cancel();
            if tokio::time::timeout(WIND_DOWN, &mut active.task).await.is_err() {
                active.task.abort();
            }
        }
        self.transport.close().await;
    }
}

/// Sends one run's events to the engine
struct Reporter {
    transport: Arc<Transport>,
    request_id: RequestId,
    agent_id: AgentId,
}

impl Reporter {
    async fn emit(&self, event: RunEvent) -> Result<()> {
        self.transport.send(&Envelope::event(&event)?).await
    }

    async fn complete(&self, summary: RunSummary, outcome: RunOutcome) -> Result<()> {
        self.emit(RunEvent::RunCompleted {
            request_id: self.request_id,
            agent_id: self.agent_id,
            summary,
            outcome,
        })
        .await
    }
}

async fn execute(reporter: Reporter, command: RunCommand, cancel: CancellationToken) {
    let request_id = command.request_id;
    if let Err(e) = run_cases(&reporter, command, &cancel).await {
        warn!(request_id = %request_id, "Run aborted: {}", e);
    }
}

async fn run_cases(
    reporter: &Reporter,
    command: RunCommand,
    cancel: &CancellationToken,
) -> Result<()> {
    let RunCommand {
        request_id,
        package,
        filter,
    } = command;
    let agent_id = reporter.agent_id;

    let cases = plan(&package, &filter);
    let total = cases.len();
    info!(request_id = %request_id, tests = total, "Run started");

    reporter
        .emit(RunEvent::Started {
            request_id,
            agent_id,
            test_count: total,
        })
        .await?;

    let mut summary = RunSummary::default();
    for (index, case) in cases.into_iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(request_id = %request_id, completed = index, "Run cancelled");
                return reporter.complete(summary, RunOutcome::Cancelled).await;
            }
            _ = tokio::time::sleep(Duration::from_millis(case.duration_ms)) => {}
        }

        summary.record(&case);
        reporter
            .emit(RunEvent::TestCaseResult {
                request_id,
                agent_id,
                result: case,
            })
            .await?;
        reporter
            .emit(RunEvent::Progress {
                request_id,
                agent_id,
                completed: index + 1,
                total,
            })
            .await?;
    }

    info!(request_id = %request_id, passed = summary.passed, failed = summary.failed, "Run finished");
    reporter.complete(summary, RunOutcome::Finished).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuntimeTarget, TestFilter, TestOutcome, TestPackage};
    use crate::runtime::test_support::write_suite;
    use tokio::net::TcpListener;

    /// Engine end of a connected, welcomed agent
    async fn connected() -> (Transport, AgentBootstrap, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bootstrap = AgentBootstrap {
            agent_id: AgentId::new(),
            endpoint: listener.local_addr().unwrap(),
            runtime: RuntimeTarget::new("net-8.0"),
        };
        let agent = tokio::spawn(run_agent(bootstrap.clone()));

        let (stream, peer) = listener.accept().await.unwrap();
        let transport = Transport::new(stream, peer.to_string(), DEFAULT_MAX_FRAME_BYTES);
        let frame = handshake::read_hello(&transport, Duration::from_secs(2))
            .await
            .unwrap();
        frame.verify().unwrap();
        assert_eq!(frame.hello.agent_id, bootstrap.agent_id);
        assert_eq!(frame.hello.runtime, bootstrap.runtime);
        assert_eq!(frame.hello.pid, std::process::id());
        handshake::welcome(&transport, &frame.hello).await.unwrap();

        (transport, bootstrap, agent)
    }

    async fn send_run(transport: &Transport, package: TestPackage) -> RequestId {
        let request_id = RequestId::new();
        let command = RunCommand {
            request_id,
            package,
            filter: TestFilter::empty(),
        };
        let envelope = Envelope::new(request_id.as_ulid(), MessageKind::Run, &command).unwrap();
        transport.send(&envelope).await.unwrap();
        request_id
    }

    async fn next_event(transport: &Transport) -> RunEvent {
        tokio::time::timeout(Duration::from_secs(5), transport.receive())
            .await
            .unwrap()
            .unwrap()
            .run_event()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_executes_run_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "math.json",
            &[("adds", TestOutcome::Passed, 1), ("divides", TestOutcome::Failed, 1)],
        );
        let (transport, _bootstrap, agent) = connected().await;

        let request_id = send_run(&transport, TestPackage::new(vec![suite])).await;
        let mut events = Vec::new();
        loop {
            let event = next_event(&transport).await;
            assert_eq!(event.request_id(), request_id);
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }

        assert!(matches!(events[0], RunEvent::Started { test_count: 2, .. }));
        assert!(matches!(events[1], RunEvent::TestCaseResult { .. }));
        assert!(matches!(
            events[2],
            RunEvent::Progress { completed: 1, total: 2, .. }
        ));
        match events.last().unwrap() {
            RunEvent::RunCompleted {
                summary,
                outcome: RunOutcome::Finished,
                ..
            } => {
                assert_eq!(summary.passed, 1);
                assert_eq!(summary.failed, 1);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }

        let ping = ulid::Ulid::new();
        transport
            .send(&Envelope::signal(ping, MessageKind::Ping))
            .await
            .unwrap();
        let pong = transport.receive().await.unwrap();
        assert_eq!(pong.kind, MessageKind::Pong);
        assert_eq!(pong.correlation_id, ping);

        transport
            .send(&Envelope::signal(ping, MessageKind::Stop))
            .await
            .unwrap();
        assert!(agent.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "slow.json",
            &[("waits", TestOutcome::Passed, 30_000)],
        );
        let (transport, _bootstrap, _agent) = connected().await;

        let request_id = send_run(&transport, TestPackage::new(vec![suite])).await;
        assert!(matches!(
            next_event(&transport).await,
            RunEvent::Started { test_count: 1, .. }
        ));

        transport
            .send(&Envelope::signal(request_id.as_ulid(), MessageKind::Cancel))
            .await
            .unwrap();
        match next_event(&transport).await {
            RunEvent::RunCompleted {
                summary, outcome, ..
            } => {
                assert_eq!(outcome, RunOutcome::Cancelled);
                assert_eq!(summary.total, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exits_when_engine_closes() {
        let (transport, _bootstrap, agent) = connected().await;
        transport.close().await;

        let result = tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_handshake_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bootstrap = AgentBootstrap {
            agent_id: AgentId::new(),
            endpoint: listener.local_addr().unwrap(),
            runtime: RuntimeTarget::default(),
        };
        let agent = tokio::spawn(run_agent(bootstrap));

        let (stream, peer) = listener.accept().await.unwrap();
        let transport = Transport::new(stream, peer.to_string(), DEFAULT_MAX_FRAME_BYTES);
        let frame = handshake::read_hello(&transport, Duration::from_secs(2))
            .await
            .unwrap();
        handshake::reject(&transport, frame.hello.agent_id.as_ulid(), "not expected").await;

        let err = agent.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("not expected"));
    }
}
