//! Error types for podssh
//!
//! Every error here may carry cluster-topology detail (object names,
//! namespaces, API messages). None of it is meant for the remote client:
//! sessions only ever show [`SessionError::CLIENT_MESSAGE`].

use std::path::PathBuf;
use thiserror::Error;

/// Login string grammar errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// No `@` separating principal from workload
    #[error("Malformed login {0:?}: expected principal@workload[.namespace]")]
    MalformedLogin(String),
}

/// Cluster directory failures other than "object not found"
#[derive(Error, Debug, Clone)]
pub enum DirectoryError {
    /// The API server answered with an error status
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// The request never got an answer
    #[error("Client error: {0}")]
    Client(String),
}

/// Identity resolution and authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Login string does not match the grammar
    #[error(transparent)]
    MalformedLogin(#[from] LoginError),

    /// Service identity object does not exist
    #[error("Service account {namespace}/{name} not found")]
    IdentityNotFound { namespace: String, name: String },

    /// Authorized-key annotation could not be parsed
    #[error("Invalid authorized key on {namespace}/{name}: {reason}")]
    InvalidAuthorizedKey {
        namespace: String,
        name: String,
        reason: String,
    },

    /// Directory lookup failed
    #[error("Directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),

    /// The connection already resolved an identity for another login
    #[error("Connection bound to {bound:?}, refusing {requested:?}")]
    LoginChanged { bound: String, requested: String },
}

/// Command resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Shell quoting could not be tokenized
    #[error("Can't split command {value:?} from {source_name}")]
    Tokenize { source_name: String, value: String },

    /// Command bytes are not valid UTF-8
    #[error("Command from {source_name} is not valid UTF-8")]
    Encoding { source_name: String },
}

/// Execution transport errors
///
/// The taxonomy is closed on purpose: only [`TransportError::Upgrade`] and
/// [`TransportError::Proxy`] happen before any session byte has flowed, so
/// only those may be retried on another transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server refused or mangled the protocol upgrade
    #[error("Upgrade negotiation failed: {0}")]
    Upgrade(String),

    /// An HTTPS proxy broke the connection setup
    #[error("Proxy failure: {0}")]
    Proxy(String),

    /// The API server rejected the exec request (forbidden, not found, ...)
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// TCP/TLS connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Credentials or client construction failed
    #[error("Transport configuration error: {0}")]
    Config(String),

    /// I/O failure on an established stream
    #[error("Stream error: {0}")]
    Stream(String),
}

impl TransportError {
    /// Whether the failure happened during transport negotiation and the
    /// alternate transport may be attempted
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Upgrade(_) | TransportError::Proxy(_))
    }
}

/// Errors terminating a single session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Target workload does not exist
    #[error("Pod {namespace}/{name} not found")]
    WorkloadNotFound { namespace: String, name: String },

    /// Principal's service account does not exist
    #[error("Service account {namespace}/{name} not found")]
    IdentityNotFound { namespace: String, name: String },

    /// Directory lookup failed
    #[error("Directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),

    /// Command could not be resolved
    #[error("Command resolution failed: {0}")]
    Command(#[from] CommandError),

    /// Execution stream failed
    #[error("Execution failed: {0}")]
    Transport(#[from] TransportError),

    /// Session or connection closed before the remote process exited
    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    /// The only text a client ever sees when a session fails
    pub const CLIENT_MESSAGE: &'static str = "can't find destination";

    /// Exit status reported to the client for a failed session
    pub const EXIT_STATUS: u32 = 1;
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
