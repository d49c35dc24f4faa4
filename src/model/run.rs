// src/model/run.rs
//! Run requests and the event stream they produce

use crate::model::ids::{AgentId, RequestId};
use crate::model::launch::{LaunchConfiguration, ProcessIsolation, RuntimeTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Description of the tests to run, forwarded verbatim to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPackage {
    pub paths: Vec<PathBuf>,

    #[serde(default)]
    pub runtime: RuntimeTarget,

    #[serde(default)]
    pub isolation: ProcessIsolation,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Free-form settings for the agent
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl TestPackage {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            runtime: RuntimeTarget::default(),
            isolation: ProcessIsolation::default(),
            working_dir: None,
            env: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeTarget) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_isolation(mut self, isolation: ProcessIsolation) -> Self {
        self.isolation = isolation;
        self
    }
}

/// Test selection; an empty filter selects everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFilter {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TestFilter {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Substring match against a test's full name
    pub fn matches(&self, full_name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| full_name.contains(p.as_str()));
        included && !self.exclude.iter().any(|p| full_name.contains(p.as_str()))
    }
}

/// One unit of work; consumed exactly once by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub request_id: RequestId,
    pub package: TestPackage,
    pub filter: TestFilter,
    pub launch: LaunchConfiguration,
}

impl RunRequest {
    pub fn new(package: TestPackage, filter: TestFilter) -> Self {
        let launch = LaunchConfiguration::for_package(&package);
        Self {
            request_id: RequestId::new(),
            package,
            filter,
            launch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    #[default]
    Passed,
    Failed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub suite: String,
    pub name: String,
    pub outcome: TestOutcome,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestCaseResult {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.suite, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn record(&mut self, result: &TestCaseResult) {
        self.total += 1;
        self.duration_ms += result.duration_ms;
        match result.outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed => self.failed += 1,
            TestOutcome::Skipped => self.skipped += 1,
            TestOutcome::Error => self.errors += 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Finished,
    Cancelled,
}

/// Progress and results of one run, tagged with the request and the agent serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        request_id: RequestId,
        agent_id: AgentId,
        test_count: usize,
    },
    TestCaseResult {
        request_id: RequestId,
        agent_id: AgentId,
        result: TestCaseResult,
    },
    Progress {
        request_id: RequestId,
        agent_id: AgentId,
        completed: usize,
        total: usize,
    },
    RunCompleted {
        request_id: RequestId,
        agent_id: AgentId,
        summary: RunSummary,
        outcome: RunOutcome,
    },
    AgentFaulted {
        request_id: RequestId,
        agent_id: AgentId,
        reason: String,
    },
}

impl RunEvent {
    pub fn faulted(request_id: RequestId, agent_id: AgentId, reason: impl Into<String>) -> Self {
        RunEvent::AgentFaulted {
            request_id,
            agent_id,
            reason: reason.into(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            RunEvent::Started { request_id, .. }
            | RunEvent::TestCaseResult { request_id, .. }
            | RunEvent::Progress { request_id, .. }
            | RunEvent::RunCompleted { request_id, .. }
            | RunEvent::AgentFaulted { request_id, .. } => *request_id,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        match self {
            RunEvent::Started { agent_id, .. }
            | RunEvent::TestCaseResult { agent_id, .. }
            | RunEvent::Progress { agent_id, .. }
            | RunEvent::RunCompleted { agent_id, .. }
            | RunEvent::AgentFaulted { agent_id, .. } => *agent_id,
        }
    }

    /// A terminal event ends the stream for its request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::AgentFaulted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, outcome: TestOutcome) -> TestCaseResult {
        TestCaseResult {
            suite: "math".into(),
            name: name.into(),
            outcome,
            duration_ms: 3,
            message: None,
        }
    }

    #[test]
    fn test_filter_matching() {
        let filter = TestFilter::empty();
        assert!(filter.is_empty());
        assert!(filter.matches("math.adds"));

        let filter = TestFilter::empty().include("math.").exclude("slow");
        assert!(filter.matches("math.adds"));
        assert!(!filter.matches("math.slow_division"));
        assert!(!filter.matches("strings.concat"));
    }

    #[test]
    fn test_summary_record() {
        let mut summary = RunSummary::default();
        summary.record(&result("a", TestOutcome::Passed));
        summary.record(&result("b", TestOutcome::Failed));
        summary.record(&result("c", TestOutcome::Skipped));

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.duration_ms, 9);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_terminal_events() {
        let request_id = RequestId::new();
        let agent_id = AgentId::new();

        let started = RunEvent::Started {
            request_id,
            agent_id,
            test_count: 0,
        };
        assert!(!started.is_terminal());

        let faulted = RunEvent::faulted(request_id, agent_id, "gone");
        assert!(faulted.is_terminal());
        assert_eq!(faulted.request_id(), request_id);
        assert_eq!(faulted.agent_id(), agent_id);
    }

    #[test]
    fn test_event_wire_tag() {
        let event = RunEvent::Progress {
            request_id: RequestId::new(),
            agent_id: AgentId::new(),
            completed: 1,
            total: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["completed"], 1);
    }

    #[test]
    fn test_full_name() {
        assert_eq!(result("adds", TestOutcome::Passed).full_name(), "math.adds");
    }
}
