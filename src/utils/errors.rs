// src/utils/errors.rs
//! Engine error taxonomy
//!
//! Failures local to one agent or one run are expressed here and never
//! escalate past the engine: they end as a terminal `RunEvent` or as an
//! error returned from a facade call.

use crate::model::{AgentId, RequestId};
use crate::runtime::agency::AgentState;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the agent communication engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Spawn or handshake did not complete in time
    #[error("agent {agent_id} failed to start: {reason}")]
    AgentStartupFailure { agent_id: AgentId, reason: String },

    /// Handshake rejected because the peers speak different protocol versions
    #[error("protocol version mismatch: expected {expected}, agent sent {found}")]
    ProtocolVersionMismatch { expected: u16, found: u16 },

    /// The peer went away or the connection dropped
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// No agent became available within the wait bound
    #[error("no agent became available within {0:?}")]
    DispatchTimeout(Duration),

    /// Pool is at its maximum size and every agent is busy
    #[error("agent pool exhausted, try again later")]
    PoolExhausted,

    #[error("failed to spawn agent process: {0}")]
    ProcessSpawnFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("agent {agent_id} cannot move from {from} to {to}")]
    InvalidTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
    },

    #[error("agent {agent_id} is already bound to request {request_id}")]
    AgentBusy {
        agent_id: AgentId,
        request_id: RequestId,
    },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the caller should simply retry later.
    ///
    /// Only resource exhaustion qualifies; everything else is a real failure.
    pub fn is_try_later(&self) -> bool {
        matches!(self, EngineError::PoolExhausted | EngineError::DispatchTimeout(_))
    }

    /// Whether the error means the underlying channel is gone
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, EngineError::ChannelClosed)
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_later_classification() {
        assert!(EngineError::PoolExhausted.is_try_later());
        assert!(EngineError::DispatchTimeout(Duration::from_secs(1)).is_try_later());
        assert!(!EngineError::ChannelClosed.is_try_later());
        assert!(!EngineError::AgentStartupFailure {
            agent_id: AgentId::new(),
            reason: "boom".into(),
        }
        .is_try_later());
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::ProtocolVersionMismatch {
            expected: 1,
            found: 7,
        };
        assert_eq!(
            err.to_string(),
            "protocol version mismatch: expected 1, agent sent 7"
        );
        assert!(EngineError::ChannelClosed.is_channel_closed());
    }
}
