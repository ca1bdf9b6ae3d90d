//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding channel traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame without even a channel byte
    #[error("Empty frame")]
    EmptyFrame,

    /// Channel id outside the known set
    #[error("Unknown channel: {0}")]
    UnknownChannel(u8),

    /// Malformed JSON document on the status or resize channel
    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}
