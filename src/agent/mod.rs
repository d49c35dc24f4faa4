// src/agent/mod.rs
//! The agent: the process that actually executes tests
//!
//! Launched by the engine (as `testrun-engine agent ...` or as an in-process
//! task), it connects back to the agency endpoint it was given and runs
//! whatever the engine sends it.
//!
//! - **runtime**: connection, handshake and the command loop
//! - **executor**: turning a test package into the cases to execute

pub mod executor;
pub mod runtime;

pub use executor::plan;
pub use runtime::run_agent;
