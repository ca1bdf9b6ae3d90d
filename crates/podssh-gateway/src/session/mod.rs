//! Session handling
//!
//! One SSH session channel maps onto one remote process.

mod orchestrator;
mod output;

pub use orchestrator::{SessionKind, SessionOrchestrator, SessionRequest};
pub use output::{ChannelOutput, SessionChannel};
