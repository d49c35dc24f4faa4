// src/runtime/mod.rs
//! Agent runtime: launching agents, tracking them, and running tests on them
//!
//! - **Process Manager**: launching agent processes (or in-process tasks)
//! - **Agency**: registry of known agents and their lifecycle state
//! - **Agent Runtime**: one agent from launch to completed handshake
//! - **Agent Pool**: reuse, limits, idle retirement and fault handling
//! - **Dispatcher**: binds a run to an agent and relays its events
//!
//! # Architecture
//!
//! ```text
//!   Dispatcher ──acquire──► AgentPool ──spawn──► AgentHandle ──launch──► AgentLauncher
//!       ▲                      │                      │                       │
//!       │ run events           │ reserve / claim      │ await handshake       ▼
//!       │                      ▼                      ▼                  agent process
//!       └──── route ───── Agency (registry) ◄── accept + hello ───── TCP transport
//! ```

pub mod agency;
pub mod agent_pool;
pub mod agent_runtime;
pub mod dispatcher;
pub mod process_manager;

#[cfg(test)]
pub(crate) mod test_support;

pub use agency::{Agency, AgencyNotice, AgentCounts, AgentSnapshot, AgentState, RunBinding};
pub use agent_pool::{AgentLease, AgentPool, AgentPoolConfig, PoolStats};
pub use agent_runtime::AgentHandle;
pub use dispatcher::{DispatchedRun, Dispatcher, RunEvents};
pub use process_manager::{
    AgentBootstrap, AgentLauncher, AgentProcess, ProcessLauncher, TaskLauncher,
};
