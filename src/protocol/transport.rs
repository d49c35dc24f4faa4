// src/protocol/transport.rs
//! Framed bidirectional channel between the engine and one agent
//!
//! Frames are a 4-byte big-endian length followed by a JSON envelope. The
//! codec buffers short reads, so a receiver only ever sees whole messages;
//! a stream that ends mid-frame surfaces as `ChannelClosed`.

use crate::protocol::envelope::Envelope;
use crate::utils::errors::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Default largest frame accepted from a peer
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub struct Transport {
    peer: String,
    reader: Mutex<FramedRead<BoxedReader, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    closed: CancellationToken,
}

impl Transport {
    /// Wrap any byte stream
    pub fn new<S>(stream: S, peer: impl Into<String>, max_frame_bytes: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::pin(read_half);
        let writer: BoxedWriter = Box::pin(write_half);

        Self {
            peer: peer.into(),
            reader: Mutex::new(FramedRead::new(reader, codec(max_frame_bytes))),
            writer: Mutex::new(FramedWrite::new(writer, codec(max_frame_bytes))),
            closed: CancellationToken::new(),
        }
    }

    /// Connect to an agency endpoint (agent side)
    pub async fn connect(endpoint: SocketAddr, max_frame_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, endpoint.to_string(), max_frame_bytes))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send one envelope; messages arrive in send order
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::ChannelClosed);
        }

        let frame = envelope.to_bytes()?;
        trace!(peer = %self.peer, kind = ?envelope.kind, bytes = frame.len(), "sending frame");

        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(EngineError::ChannelClosed),
            result = writer.send(frame) => result.map_err(|e| {
                debug!(peer = %self.peer, error = %e, "transport write failed");
                self.closed.cancel();
                EngineError::ChannelClosed
            }),
        }
    }

    /// Wait for the next whole envelope
    pub async fn receive(&self) -> Result<Envelope> {
        let mut reader = tokio::select! {
            _ = self.closed.cancelled() => return Err(EngineError::ChannelClosed),
            guard = self.reader.lock() => guard,
        };

        let frame = tokio::select! {
            _ = self.closed.cancelled() => return Err(EngineError::ChannelClosed),
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(bytes)) => Envelope::from_bytes(&bytes),
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                self.closed.cancel();
                Err(EngineError::Protocol(format!("bad frame from {}: {}", self.peer, e)))
            }
            Some(Err(e)) => {
                debug!(peer = %self.peer, error = %e, "transport read failed");
                self.closed.cancel();
                Err(EngineError::ChannelClosed)
            }
            None => {
                trace!(peer = %self.peer, "peer closed the channel");
                self.closed.cancel();
                Err(EngineError::ChannelClosed)
            }
        }
    }

    /// Close both directions; safe to call repeatedly and from either side
    pub async fn close(&self) {
        let first = !self.closed.is_cancelled();
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, SinkExt::<bytes::Bytes>::close(&mut *writer)).await;

        if first {
            debug!(peer = %self.peer, "transport closed");
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
