//! Channel frame encoding/decoding
//!
//! Each WebSocket binary message on an exec stream is one frame:
//! - channel: 1 byte
//! - payload: the rest of the message
//!
//! The v5 subprotocol adds a close signal on channel 255 whose payload is
//! the single byte of the channel being half-closed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Subprotocol with stream close support (Kubernetes 1.30+)
pub const SUBPROTOCOL_V5: &str = "v5.channel.k8s.io";

/// Subprotocol understood by every supported API server
pub const SUBPROTOCOL_V4: &str = "v4.channel.k8s.io";

/// Channel ids
pub mod channel {
    /// Channel 0: stdin
    pub const STDIN: u8 = 0;
    /// Channel 1: stdout
    pub const STDOUT: u8 = 1;
    /// Channel 2: stderr
    pub const STDERR: u8 = 2;
    /// Channel 3: final status document
    pub const ERROR: u8 = 3;
    /// Channel 4: terminal resize
    pub const RESIZE: u8 = 4;
    /// Channel 255: half-close signal (v5 only)
    pub const CLOSE: u8 = 255;
}

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFrame {
    /// Channel id
    pub channel: u8,
    /// Payload bytes
    pub payload: Bytes,
}

impl ChannelFrame {
    /// Create a new frame
    pub fn new(channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Frame carrying stdin bytes
    pub fn stdin(data: impl Into<Bytes>) -> Self {
        Self::new(channel::STDIN, data)
    }

    /// Frame half-closing the given channel
    pub fn close(channel_id: u8) -> Self {
        Self::new(channel::CLOSE, vec![channel_id])
    }

    /// Encode into a single message body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.channel);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a message body received from the remote side
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&channel_id, payload) = data.split_first().ok_or(ProtocolError::EmptyFrame)?;

        match channel_id {
            channel::STDIN
            | channel::STDOUT
            | channel::STDERR
            | channel::ERROR
            | channel::RESIZE
            | channel::CLOSE => Ok(Self {
                channel: channel_id,
                payload: Bytes::copy_from_slice(payload),
            }),
            other => Err(ProtocolError::UnknownChannel(other)),
        }
    }
}
