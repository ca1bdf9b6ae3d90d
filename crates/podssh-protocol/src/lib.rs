//! podssh-protocol: Remote-command channel protocol
//!
//! This crate defines the multiplexed channel framing spoken by the
//! cluster's pod exec endpoint once a streaming transport is upgraded:
//! every message carries a one-byte channel id followed by its payload.
//! It also models the final status document the remote side sends when
//! the executed process exits.

pub mod error;
pub mod frame;
pub mod message;
pub mod status;

pub use error::ProtocolError;
pub use frame::{channel, ChannelFrame, SUBPROTOCOL_V4, SUBPROTOCOL_V5};
pub use message::TerminalSize;
pub use status::RemoteStatus;
