// src/lib.rs
//! Testrun Engine Library
//!
//! Runs tests out of process. The engine launches agent processes, negotiates
//! a private channel with each, sends them runs, and relays the events they
//! produce back to the caller, recovering from agents that hang or crash.
//!
//! # Architecture
//!
//! - **engine**: the facade (`submit_run`, `cancel`, `subscribe`, `shutdown`)
//! - **runtime**: agency, pool, dispatcher and agent launchers
//! - **protocol**: framed transport, envelopes and the handshake
//! - **agent**: the agent side, run by `testrun-engine agent`
//! - **model**: ids, launch configurations, run requests and events
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use testrun_engine::{Engine, EngineConfig, TestFilter, TestPackage};
//!
//! # async fn example() -> testrun_engine::Result<()> {
//! let engine = Engine::start(EngineConfig::load()?).await?;
//! let mut run = engine
//!     .submit_run(TestPackage::new(vec!["suite.json".into()]), TestFilter::empty())
//!     .await?;
//! while let Some(event) = run.next_event().await {
//!     println!("{:?}", event);
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod engine;
pub mod model;
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod utils;

pub use engine::{Engine, RunHandle};
pub use model::{
    AgentId, LaunchConfiguration, RequestId, RunEvent, RunOutcome, RunSummary, RuntimeTarget,
    TestCaseResult, TestFilter, TestOutcome, TestPackage,
};
pub use runtime::{AgentState, PoolStats, RunEvents};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }

    /// Build time, if the timestamp was recorded
    pub fn built_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let secs = self.build_timestamp.parse().ok()?;
        chrono::DateTime::from_timestamp(secs, 0)
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.version, self.git_hash, self.rustc_version)
    }
}
