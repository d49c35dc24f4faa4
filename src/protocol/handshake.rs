// src/protocol/handshake.rs
//! Hello/welcome exchange that opens every agent connection
//!
//! The agent speaks first. The agency answers with `Welcome` once the hello
//! names an agent it launched and a protocol version it understands, or with
//! `Reject` before closing the connection.

use crate::protocol::envelope::{Envelope, Hello, MessageKind, Reject, Welcome, PROTOCOL_VERSION};
use crate::protocol::transport::Transport;
use crate::utils::errors::{EngineError, Result};
use std::time::Duration;
use tracing::debug;

/// Agent side: announce ourselves and wait for the verdict
pub async fn offer(transport: &Transport, hello: &Hello) -> Result<Welcome> {
    let envelope = Envelope::new(hello.agent_id.as_ulid(), MessageKind::Hello, hello)?;
    transport.send(&envelope).await?;

    let reply = transport.receive().await?;
    match reply.kind {
        MessageKind::Welcome => {
            let welcome: Welcome = reply.payload()?;
            if welcome.protocol_version != PROTOCOL_VERSION {
                return Err(EngineError::ProtocolVersionMismatch {
                    expected: PROTOCOL_VERSION,
                    found: welcome.protocol_version,
                });
            }
            Ok(welcome)
        }
        MessageKind::Reject => {
            let reject: Reject = reply.payload()?;
            Err(EngineError::Protocol(format!(
                "agency rejected handshake: {}",
                reject.reason
            )))
        }
        other => Err(EngineError::Protocol(format!(
            "expected welcome, got {:?}",
            other
        ))),
    }
}

/// First frame of a connection, decoded but not yet verified
#[derive(Debug, Clone)]
pub struct HelloFrame {
    /// Version stamped on the envelope itself
    pub envelope_version: u16,
    pub hello: Hello,
}

impl HelloFrame {
    /// Both the envelope and the hello must carry our protocol version
    pub fn verify(&self) -> Result<()> {
        for found in [self.envelope_version, self.hello.protocol_version] {
            if found != PROTOCOL_VERSION {
                return Err(EngineError::ProtocolVersionMismatch {
                    expected: PROTOCOL_VERSION,
                    found,
                });
            }
        }
        Ok(())
    }
}

/// Agency side: read the first frame and decode it as a hello.
///
/// Version checks are left to [`HelloFrame::verify`] so the caller still
/// learns which agent spoke before deciding to reject it.
pub async fn read_hello(transport: &Transport, timeout: Duration) -> Result<HelloFrame> {
    let envelope = tokio::time::timeout(timeout, transport.receive())
        .await
        .map_err(|_| EngineError::Protocol(format!("no hello within {:?}", timeout)))??;

    if envelope.kind != MessageKind::Hello {
        return Err(EngineError::Protocol(format!(
            "expected hello, got {:?}",
            envelope.kind
        )));
    }

    let hello: Hello = envelope.payload()?;
    debug!(agent_id = %hello.agent_id, pid = hello.pid, runtime = %hello.runtime, "hello received");

    Ok(HelloFrame {
        envelope_version: envelope.version,
        hello,
    })
}

/// Agency side: accept the agent
pub async fn welcome(transport: &Transport, hello: &Hello) -> Result<()> {
    let welcome = Welcome {
        protocol_version: PROTOCOL_VERSION,
    };
    let envelope = Envelope::new(hello.agent_id.as_ulid(), MessageKind::Welcome, &welcome)?;
    transport.send(&envelope).await
}

/// Agency side: refuse the agent, then close the connection
pub async fn reject(transport: &Transport, correlation: ulid::Ulid, reason: &str) {
    let reject = Reject {
        reason: reason.to_string(),
    };
    if let Ok(envelope) = Envelope::new(correlation, MessageKind::Reject, &reject) {
        let _ = transport.send(&envelope).await;
    }
    transport.close().await;
}
