//! podssh-core: Configuration and shared types for podssh
//!
//! This crate provides the gateway configuration, the login grammar that
//! maps an SSH username onto a workload, and the error taxonomy shared by
//! every component of the session-bridging engine.

pub mod config;
pub mod error;
pub mod types;

pub use error::{
    AuthError, CommandError, ConfigError, DirectoryError, LoginError, SessionError,
    TransportError,
};
pub use types::{Login, DEFAULT_NAMESPACE};
