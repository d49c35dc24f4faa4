// src/protocol/envelope.rs
//! Wire-level message envelopes
//!
//! Every frame on an agent connection carries one JSON-encoded `Envelope`.
//! Run events travel as a serialized `RunEvent` in the payload of the
//! matching kind, so the engine can relay them unmodified.

use crate::model::{AgentId, RequestId, RunEvent, RuntimeTarget, TestFilter, TestPackage};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Version spoken by this build; peers must match exactly
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Hello,
    Welcome,
    Reject,
    Run,
    Cancel,
    Stop,
    Ping,
    Pong,
    Started,
    TestCaseResult,
    Progress,
    RunCompleted,
}

impl MessageKind {
    /// Kinds whose payload is a `RunEvent`
    pub fn is_run_event(&self) -> bool {
        matches!(
            self,
            MessageKind::Started
                | MessageKind::TestCaseResult
                | MessageKind::Progress
                | MessageKind::RunCompleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub correlation_id: Ulid,
    pub kind: MessageKind,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(correlation_id: Ulid, kind: MessageKind, payload: &T) -> Result<Self> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Envelope without a payload (cancel, stop, ping, pong)
    pub fn signal(correlation_id: Ulid, kind: MessageKind) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            kind,
            payload: serde_json::Value::Null,
        }
    }

    /// Wrap a run event, correlated by its request id
    pub fn event(event: &RunEvent) -> Result<Self> {
        let kind = match event {
            RunEvent::Started { .. } => MessageKind::Started,
            RunEvent::TestCaseResult { .. } => MessageKind::TestCaseResult,
            RunEvent::Progress { .. } => MessageKind::Progress,
            RunEvent::RunCompleted { .. } => MessageKind::RunCompleted,
            RunEvent::AgentFaulted { .. } => {
                return Err(EngineError::Protocol(
                    "agent faults are synthesized locally and never sent".to_string(),
                ))
            }
        };
        Self::new(event.request_id().as_ulid(), kind, event)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EngineError::Protocol(format!("malformed {:?} payload: {}", self.kind, e))
        })
    }

    /// Decode the run event carried by an event envelope
    pub fn run_event(&self) -> Result<RunEvent> {
        if !self.kind.is_run_event() {
            return Err(EngineError::Protocol(format!(
                "{:?} does not carry a run event",
                self.kind
            )));
        }
        self.payload()
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Protocol(format!("undecodable envelope: {}", e)))
    }
}

/// First message an agent sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u16,
    pub agent_id: AgentId,
    pub pid: u32,
    pub runtime: RuntimeTarget,
    pub agent_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub protocol_version: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub reason: String,
}

/// Run command sent to a bound agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub request_id: RequestId,
    pub package: TestPackage,
    pub filter: TestFilter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunOutcome, RunSummary};

    #[test]
    fn test_event_envelope_kind_and_correlation() {
        let request_id = RequestId::new();
        let event = RunEvent::RunCompleted {
            request_id,
            agent_id: AgentId::new(),
            summary: RunSummary::default(),
            outcome: RunOutcome::Finished,
        };

        let envelope = Envelope::event(&event).unwrap();
        assert_eq!(envelope.kind, MessageKind::RunCompleted);
        assert_eq!(envelope.correlation_id, request_id.as_ulid());
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert_eq!(envelope.run_event().unwrap(), event);
    }

    #[test]
    fn test_faults_are_not_wire_events() {
        let event = RunEvent::faulted(RequestId::new(), AgentId::new(), "crash");
        assert!(Envelope::event(&event).is_err());
    }

    #[test]
    fn test_signal_has_no_payload() {
        let envelope = Envelope::signal(Ulid::new(), MessageKind::Ping);
        assert!(envelope.payload.is_null());
        assert!(envelope.run_event().is_err());
    }

    #[test]
    fn test_kind_wire_names() {
        let envelope = Envelope::signal(Ulid::new(), MessageKind::TestCaseResult);
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "test_case_result");
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let envelope = Envelope::signal(Ulid::new(), MessageKind::Hello);
        let err = envelope.payload::<Hello>().unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));

        let err = Envelope::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }
}
