// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `testrun.{toml,yaml,json}` file (or an explicit path), then
//! `TESTRUN__SECTION__KEY` environment variables.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agency: AgencyConfig,
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub agent: AgentProgramConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,

    /// How long `shutdown` waits for in-flight runs before cancelling them
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agency: AgencyConfig::default(),
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            agent: AgentProgramConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Listener and handshake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    /// Address agents connect back to
    pub bind_addr: String,

    /// Bound on the hello/welcome exchange, measured from process spawn
    pub handshake_timeout_ms: u64,

    /// Largest accepted frame
    pub max_frame_bytes: usize,

    /// Number of departed agent records kept for diagnostics
    pub departed_capacity: usize,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            handshake_timeout_ms: 10_000,
            max_frame_bytes: 8 * 1024 * 1024,
            departed_capacity: 64,
        }
    }
}

impl AgencyConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Pool sizing and lifetime policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Agents kept alive even when idle
    pub min_agents: usize,

    /// Hard cap on live agents
    pub max_agents: usize,

    /// How long a submit waits for an agent before giving up
    pub dispatch_timeout_ms: u64,

    /// Idle time after which agents beyond the minimum are retired
    pub idle_timeout_ms: u64,

    /// Supervisor tick
    pub reap_interval_ms: u64,

    /// Time a stopping agent gets to exit before it is killed
    pub stop_grace_ms: u64,

    /// Ping period; heartbeats are off when unset
    pub heartbeat_interval_ms: Option<u64>,

    /// Silence after which a connected agent is considered hung
    pub heartbeat_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_agents: 0,
            max_agents: 4,
            dispatch_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            reap_interval_ms: 1_000,
            stop_grace_ms: 2_000,
            heartbeat_interval_ms: None,
            heartbeat_timeout_ms: 15_000,
        }
    }
}

/// Per-run relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long a cancelled run's agent has to acknowledge
    pub cancel_grace_ms: u64,

    /// Buffered events between an agent's reader loop and its run relay
    pub event_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 5_000,
            event_buffer: 256,
        }
    }
}

impl DispatchConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// How agent processes are started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProgramConfig {
    /// Agent executable; defaults to the running executable
    pub program: Option<PathBuf>,

    /// Arguments placed before the generated agent arguments
    pub args: Vec<String>,

    /// Executable overrides keyed by runtime key (`net-8.0`, `net-4.8-x86`, ...)
    pub runtimes: HashMap<String, PathBuf>,

    /// Runtime framework used to warm the pool
    pub default_runtime: String,
}

impl Default for AgentProgramConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["agent".to_string()],
            runtimes: HashMap::new(),
            default_runtime: "any".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit newline-delimited JSON
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint; metrics are not exported when unset
    pub prometheus_addr: Option<String>,
}

impl EngineConfig {
    /// Load configuration from `testrun.*` in the working directory and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, reading `path` instead of the default file when given
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("testrun").required(false)),
        };

        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix("TESTRUN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_agents == 0 {
            return Err(EngineError::ConfigError(
                "pool.max_agents must be at least 1".to_string(),
            ));
        }
        if self.pool.min_agents > self.pool.max_agents {
            return Err(EngineError::ConfigError(format!(
                "pool.min_agents ({}) exceeds pool.max_agents ({})",
                self.pool.min_agents, self.pool.max_agents
            )));
        }
        if self.agency.handshake_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "agency.handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.pool.reap_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "pool.reap_interval_ms must be positive".to_string(),
            ));
        }
        if self.pool.heartbeat_interval_ms == Some(0) {
            return Err(EngineError::ConfigError(
                "pool.heartbeat_interval_ms must be positive when set".to_string(),
            ));
        }
        if self.dispatch.event_buffer == 0 {
            return Err(EngineError::ConfigError(
                "dispatch.event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.min_agents, 0);
        assert_eq!(config.pool.max_agents, 4);
        assert_eq!(config.agency.bind_addr, "127.0.0.1:0");
        assert_eq!(config.agent.args, vec!["agent".to_string()]);
        assert!(config.pool.heartbeat_interval_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.pool.min_agents = 5;
        config.pool.max_agents = 2;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pool.max_agents = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pool.heartbeat_interval_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
shutdown_timeout_ms = 500

[pool]
min_agents = 1
max_agents = 3
heartbeat_interval_ms = 250

[agent]
default_runtime = "net-8.0"
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.pool.min_agents, 1);
        assert_eq!(config.pool.max_agents, 3);
        assert_eq!(config.pool.heartbeat_interval_ms, Some(250));
        assert_eq!(config.agent.default_runtime, "net-8.0");
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(500));
        // untouched sections keep their defaults
        assert_eq!(config.dispatch.event_buffer, 256);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[pool]\nmin_agents = 9\nmax_agents = 1\n").unwrap();

        let err = EngineConfig::load_from(Some(&path)).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }
}
