// src/protocol/mod.rs
//! Engine/agent wire protocol
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  length-prefixed JSON envelopes  ┌────────────┐
//! │   Agency   │ ◄──────────────────────────────► │   Agent    │
//! │ (listener) │   hello → welcome | reject       │ (process)  │
//! └────────────┘   run / cancel / stop / ping     └────────────┘
//!                  started / result / progress / completed
//! ```

pub mod envelope;
pub mod handshake;
pub mod transport;

pub use envelope::{
    Envelope, Hello, MessageKind, Reject, RunCommand, Welcome, PROTOCOL_VERSION,
};
pub use handshake::HelloFrame;
pub use transport::{Transport, DEFAULT_MAX_FRAME_BYTES};
