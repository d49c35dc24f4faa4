// src/runtime/agent_runtime.rs
//! Handle to one agent between launch and the end of its handshake
//!
//! The handle owns the launched process until the agent is ready and the
//! pool hands the process over to the agency. A handle dropped before that
//! point (timeout, error, or a cancelled spawning task) kills the process and
//! faults the agent's record, so no exit path leaks an agent.

use crate::model::{AgentId, LaunchConfiguration};
use crate::runtime::agency::Agency;
use crate::runtime::process_manager::{
    kill_detached, kill_process, AgentBootstrap, AgentLauncher, AgentProcess,
};
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct AgentHandle {
    agent_id: AgentId,
    agency: Arc<Agency>,

    /// Owned until adopted by the agency
    process: Option<Box<dyn AgentProcess>>,

    /// Handshake completion from the agency
    ready: Option<oneshot::Receiver<std::result::Result<(), String>>>,

    /// Why the agent never became ready
    failure: Option<String>,

    started_at: tokio::time::Instant,
}

impl AgentHandle {
    /// Launch the agent for an already reserved record. Returns as soon as
    /// the process exists; the handshake completes asynchronously.
    pub fn spawn(
        launcher: &dyn AgentLauncher,
        agency: Arc<Agency>,
        agent_id: AgentId,
        launch: &LaunchConfiguration,
    ) -> Result<Self> {
        let ready = agency.await_handshake(agent_id)?;
        let bootstrap = AgentBootstrap {
            agent_id,
            endpoint: agency.endpoint(),
            runtime: launch.runtime.clone(),
        };

        let process = launcher.launch(&bootstrap, launch)?;
        agency.attach_pid(agent_id, process.pid());

        Ok(Self {
            agent_id,
            agency,
            process: Some(process),
            ready: Some(ready),
            failure: None,
            started_at: tokio::time::Instant::now(),
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    /// Why the agent failed to become ready, if it did
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Time since launch
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait until the handshake completes. On timeout, handshake failure or
    /// early process exit the agent is killed and `false` is returned.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> bool {
        let Some(ready) = self.ready.take() else {
            return self.failure.is_none() && self.process.is_some();
        };

        let process = self.process.as_mut();
        let exited = async move {
            match process {
                Some(process) => {
                    let _ = process.wait().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            handshake = tokio::time::timeout(timeout, ready) => match handshake {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(reason))) => Err(reason),
                Ok(Err(_)) => Err("agency dropped the handshake".to_string()),
                Err(_) => Err(format!("no handshake within {:?}", timeout)),
            },
            _ = exited => Err("agent exited before completing the handshake".to_string()),
        };

        match outcome {
            Ok(()) => {
                debug!(agent_id = %self.agent_id, elapsed = ?self.elapsed(), "Agent ready");
                true
            }
            Err(reason) => {
                warn!(agent_id = %self.agent_id, "Agent failed to start: {}", reason);
                self.agency.fault(self.agent_id, &reason);
                self.failure = Some(reason);
                self.kill().await;
                false
            }
        }
    }

    /// Forcefully terminate and reap the process
    pub async fn kill(&mut self) {
        if let Some(process) = self.process.take() {
            kill_process(process).await;
        }
        if self.failure.is_none() {
            self.failure = Some("killed".to_string());
            self.agency.fault(self.agent_id, "agent killed during startup");
        }
    }

    /// Hand the process to the agency record; the agency owns it from here on
    pub fn adopt(mut self) {
        if let Some(process) = self.process.take() {
            if let Some(orphan) = self.agency.adopt_process(self.agent_id, process) {
                debug!(agent_id = %self.agent_id, "Agent departed before adoption, killing");
                kill_detached(orphan);
            }
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            warn!(agent_id = %self.agent_id, "Agent handle dropped during startup, killing agent");
            self.agency
                .fault(self.agent_id, "agent startup abandoned");
            kill_detached(process);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::agency::{AgentState, Slot};
    use crate::runtime::process_manager::TaskLauncher;
    use crate::runtime::test_support;
    use crate::utils::config::AgencyConfig;

    async fn reserved() -> (Arc<Agency>, AgentId) {
        let (agency, _notices) = Agency::bind(AgencyConfig::default()).await.unwrap();
        match agency.reserve_slot(&LaunchConfiguration::default(), 4, false) {
            Slot::Reserved { agent_id, .. } => (agency, agent_id),
            Slot::Full => panic!("pool unexpectedly full"),
        }
    }

    #[tokio::test]
    async fn test_ready_after_handshake() {
        let (agency, agent_id) = reserved().await;
        let launcher = test_support::idle_agents();

        let mut handle = AgentHandle::spawn(
            &launcher,
            Arc::clone(&agency),
            agent_id,
            &LaunchConfiguration::default(),
        )
        .unwrap();

        assert!(handle.wait_for_ready(Duration::from_secs(2)).await);
        assert!(handle.failure().is_none());
        handle.adopt();

        assert_eq!(agency.lookup(agent_id).unwrap().state, AgentState::Ready);
    }

    #[tokio::test]
    async fn test_silent_agent_times_out() {
        let (agency, agent_id) = reserved().await;
        let launcher = TaskLauncher::new(|_bootstrap, _launch| std::future::pending::<()>());

        let mut handle = AgentHandle::spawn(
            &launcher,
            Arc::clone(&agency),
            agent_id,
            &LaunchConfiguration::default(),
        )
        .unwrap();

        assert!(!handle.wait_for_ready(Duration::from_millis(100)).await);
        assert!(handle.failure().unwrap().contains("no handshake"));
        assert!(agency.lookup(agent_id).is_none());
        assert_eq!(agency.recent_departures()[0].state, AgentState::Faulted);
    }

    #[tokio::test]
    async fn test_early_exit_fails_fast() {
        let (agency, agent_id) = reserved().await;
        let launcher = TaskLauncher::new(|_bootstrap, _launch| async {});

        let mut handle = AgentHandle::spawn(
            &launcher,
            Arc::clone(&agency),
            agent_id,
            &LaunchConfiguration::default(),
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        assert!(!handle.wait_for_ready(Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(agency.lookup(agent_id).is_none());
    }

    #[tokio::test]
    async fn test_drop_faults_record() {
        let (agency, agent_id) = reserved().await;
        let launcher = TaskLauncher::new(|_bootstrap, _launch| std::future::pending::<()>());

        let handle = AgentHandle::spawn(
            &launcher,
            Arc::clone(&agency),
            agent_id,
            &LaunchConfiguration::default(),
        )
        .unwrap();
        drop(handle);

        assert!(agency.lookup(agent_id).is_none());
    }
}
