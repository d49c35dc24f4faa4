// src/runtime/test_support.rs
//! Scripted in-process agents for pool, dispatcher and engine tests

use crate::model::{RunEvent, TestOutcome};
use crate::protocol::envelope::{Envelope, Hello, MessageKind, RunCommand, PROTOCOL_VERSION};
use crate::protocol::handshake;
use crate::protocol::transport::{Transport, DEFAULT_MAX_FRAME_BYTES};
use crate::runtime::process_manager::{AgentBootstrap, TaskLauncher};
use std::path::{Path, PathBuf};

/// Connect and complete the handshake with the given protocol version
pub(crate) async fn connect(bootstrap: &AgentBootstrap, version: u16) -> Option<Transport> {
    let transport = Transport::connect(bootstrap.endpoint, DEFAULT_MAX_FRAME_BYTES)
        .await
        .ok()?;
    let hello = Hello {
        protocol_version: version,
        agent_id: bootstrap.agent_id,
        pid: 0,
        runtime: bootstrap.runtime.clone(),
        agent_version: "scripted".to_string(),
    };
    handshake::offer(&transport, &hello).await.ok()?;
    Some(transport)
}

async fn send(transport: &Transport, event: RunEvent) {
    if let Ok(envelope) = Envelope::event(&event) {
        let _ = transport.send(&envelope).await;
    }
}

/// Agents that never connect back
pub(crate) fn silent_agents() -> TaskLauncher {
    TaskLauncher::new(|_bootstrap, _launch| std::future::pending::<()>())
}

/// Agents that speak a protocol version we do not
pub(crate) fn wrong_version_agents() -> TaskLauncher {
    TaskLauncher::new(|bootstrap, _launch| async move {
        let _ = connect(&bootstrap, PROTOCOL_VERSION + 1).await;
        std::future::pending::<()>().await
    })
}

/// Agents that answer pings, finish every run with no tests, and exit on stop
pub(crate) fn idle_agents() -> TaskLauncher {
    TaskLauncher::new(|bootstrap, _launch| async move {
        let Some(transport) = connect(&bootstrap, PROTOCOL_VERSION).await else {
            return;
        };
        let agent_id = bootstrap.agent_id;

        while let Ok(envelope) = transport.receive().await {
            match envelope.kind {
                MessageKind::Ping => {
                    let pong = Envelope::signal(envelope.correlation_id, MessageKind::Pong);
                    let _ = transport.send(&pong).await;
                }
                MessageKind::Run => {
                    let Ok(command) = envelope.payload::<RunCommand>() else {
                        return;
                    };
                    let request_id = command.request_id;
                    send(
                        &transport,
                        RunEvent::Started {
                            request_id,
                            agent_id,
                            test_count: 0,
                        },
                    )
                    .await;
                    send(
                        &transport,
                        RunEvent::RunCompleted {
                            request_id,
                            agent_id,
                            summary: Default::default(),
                            outcome: crate::model::RunOutcome::Finished,
                        },
                    )
                    .await;
                }
                MessageKind::Stop => return,
                _ => {}
            }
        }
    })
}

/// Agents that start a run and then die with the connection open mid-run
pub(crate) fn crashing_agents() -> TaskLauncher {
    TaskLauncher::new(|bootstrap, _launch| async move {
        let Some(transport) = connect(&bootstrap, PROTOCOL_VERSION).await else {
            return;
        };

        while let Ok(envelope) = transport.receive().await {
            if envelope.kind != MessageKind::Run {
                continue;
            }
            let Ok(command) = envelope.payload::<RunCommand>() else {
                return;
            };
            send(
                &transport,
                RunEvent::Started {
                    request_id: command.request_id,
                    agent_id: bootstrap.agent_id,
                    test_count: 3,
                },
            )
            .await;
            // returning drops the connection
            return;
        }
    })
}

/// Agents that start runs but ignore everything afterwards, pings and cancels included
pub(crate) fn deaf_agents() -> TaskLauncher {
    TaskLauncher::new(|bootstrap, _launch| async move {
        let Some(transport) = connect(&bootstrap, PROTOCOL_VERSION).await else {
            return;
        };

        while let Ok(envelope) = transport.receive().await {
            if envelope.kind != MessageKind::Run {
                continue;
            }
            if let Ok(command) = envelope.payload::<RunCommand>() {
                send(
                    &transport,
                    RunEvent::Started {
                        request_id: command.request_id,
                        agent_id: bootstrap.agent_id,
                        test_count: 1,
                    },
                )
                .await;
            }
        }
    })
}

/// Write a suite manifest with one case per `(name, outcome, duration_ms)`
pub(crate) fn write_suite(dir: &Path, file: &str, cases: &[(&str, TestOutcome, u64)]) -> PathBuf {
    let tests: Vec<_> = cases
        .iter()
        .map(|(name, outcome, duration_ms)| {
            serde_json::json!({
                "name": name,
                "outcome": outcome,
                "duration_ms": duration_ms,
            })
        })
        .collect();

    let path = dir.join(file);
    std::fs::write(&path, serde_json::json!({ "tests": tests }).to_string())
        .expect("write suite manifest");
    path
}
