// src/model/mod.rs
//! Data model shared by the engine and its agents
//!
//! - **ids**: `AgentId` and `RequestId`
//! - **launch**: what kind of agent to start
//! - **run**: test packages, filters, run requests and the events they produce

pub mod ids;
pub mod launch;
pub mod run;

pub use ids::{AgentId, RequestId};
pub use launch::{Bitness, LaunchConfiguration, ProcessIsolation, RuntimeTarget};
pub use run::{
    RunEvent, RunOutcome, RunRequest, RunSummary, TestCaseResult, TestFilter, TestOutcome,
    TestPackage,
};
