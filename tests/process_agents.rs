// tests/process_agents.rs
//! End-to-end runs against real agent processes (the `agent` subcommand)

#![cfg(unix)]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use testrun_engine::runtime::ProcessLauncher;
use testrun_engine::{Engine, EngineConfig, RunEvent, RunOutcome, TestFilter, TestPackage};

fn launcher() -> Arc<ProcessLauncher> {
    Arc::new(ProcessLauncher::new(
        env!("CARGO_BIN_EXE_testrun-engine"),
        vec!["agent".to_string()],
    ))
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.max_agents = 2;
    config.pool.dispatch_timeout_ms = 20_000;
    config.pool.stop_grace_ms = 1_000;
    config.agency.handshake_timeout_ms = 15_000;
    config.dispatch.cancel_grace_ms = 1_000;
    config.shutdown_timeout_ms = 5_000;
    config
}

fn write_suite(dir: &Path, file: &str, body: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_agent_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let suite = write_suite(
        dir.path(),
        "math.json",
        r#"{"suite":"math","tests":[
            {"name":"adds","outcome":"passed","duration_ms":5},
            {"name":"divides","outcome":"failed","duration_ms":5,"message":"by zero"}
        ]}"#,
    );

    let engine = Engine::with_launcher(config(), launcher()).await.unwrap();
    let handle = engine
        .submit_run(TestPackage::new(vec![suite]), TestFilter::empty())
        .await
        .unwrap();
    let agent_id = handle.agent_id();
    assert!(engine.lookup(agent_id).unwrap().pid.is_some());

    let events = tokio::time::timeout(Duration::from_secs(20), handle.into_events().collect_all())
        .await
        .unwrap();

    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TestCaseResult { result, .. } => Some(result.full_name()),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec!["math.adds", "math.divides"]);

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

    engine.shutdown().await;
    assert_eq!(engine.pool_stats().total_agents, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_killed_busy_agent_faults_its_run() {
    let dir = tempfile::tempdir().unwrap();
    let suite = write_suite(
        dir.path(),
        "slow.json",
        r#"{"tests":[{"name":"hangs","duration_ms":60000}]}"#,
    );

    let engine = Engine::with_launcher(config(), launcher()).await.unwrap();
    let mut handle = engine
        .submit_run(TestPackage::new(vec![suite]), TestFilter::empty())
        .await
        .unwrap();
    let agent_id = handle.agent_id();

    let started = tokio::time::timeout(Duration::from_secs(20), handle.next_event())
        .await
        .unwrap();
    assert!(matches!(started, Some(RunEvent::Started { .. })));

    let pid = engine.lookup(agent_id).unwrap().pid.unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let mut rest = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
        .await
        .unwrap()
    {
        rest.push(event);
    }

    assert_eq!(rest.len(), 1);
    assert!(matches!(rest[0], RunEvent::AgentFaulted { .. }));

    let mut removed = false;
    for _ in 0..100 {
        if engine.lookup(agent_id).is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(removed);

    engine.shutdown().await;
}
