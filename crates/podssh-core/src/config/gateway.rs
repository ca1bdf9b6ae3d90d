//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::DEFAULT_NAMESPACE;

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Path to the host key file
    pub host_key_path: PathBuf,

    /// Namespace used when a login omits one
    pub default_namespace: String,

    /// Authentication settings
    pub auth: AuthSettings,

    /// Annotation keys read from pods and service accounts
    pub annotations: AnnotationKeys,

    /// Connection admission rate limiting
    pub rate_limit: RateLimitSettings,

    /// Exec transport selection
    pub transport: TransportSettings,

    /// SFTP subsystem
    pub sftp: SftpSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            host_key_path: config_dir.join("host_key"),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            auth: AuthSettings::default(),
            annotations: AnnotationKeys::default(),
            rate_limit: RateLimitSettings::default(),
            transport: TransportSettings::default(),
            sftp: SftpSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Reject values the gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.rate_limit;

        if limits.idle_ttl.is_zero() {
            return Err(ConfigError::Invalid("rate_limit.idle_ttl must be positive".into()));
        }
        if limits.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "rate_limit.sweep_interval must be positive".into(),
            ));
        }
        if !limits.penalty_rate.is_finite() || limits.penalty_rate <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.penalty_rate must be a positive number, got {}",
                limits.penalty_rate
            )));
        }
        if limits.penalty_burst == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.penalty_burst must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Offer password authentication (every password is still rejected
    /// unless a verifier is installed)
    pub password_enabled: bool,

    /// Delay before answering a rejected authentication attempt
    #[serde(with = "duration_secs")]
    pub auth_rejection_time: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            password_enabled: false,
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

/// Annotation keys carrying per-object gateway metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationKeys {
    /// Public key accepted for the service account (service account only)
    pub authorized_key: String,
    /// Default command when the client supplies none
    pub command: String,
    /// Command prepended to every resolved command
    pub prefix_command: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self {
            authorized_key: "ssh.barpilot.io/publickey".to_string(),
            command: "ssh.barpilot.io/command".to_string(),
            prefix_command: "ssh.barpilot.io/prefix-command".to_string(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// How long an address entry lives after it was created
    #[serde(with = "duration_secs")]
    pub idle_ttl: Duration,

    /// Rate (events per second) of a freshly penalized address
    pub penalty_rate: f64,

    /// Burst of a freshly penalized address
    pub penalty_burst: u32,

    /// Interval between expired-entry sweeps
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(600),
            penalty_rate: 1.0,
            penalty_burst: 1,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Exec transport flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// The cluster client's WebSocket exec (v5/v4 channel protocol)
    #[serde(alias = "ws")]
    WebSocket,
    /// Direct HTTP/1.1 upgrade, bypassing proxies, v5/v4 channel protocol
    Legacy,
}

impl TransportKind {
    /// The other transport
    pub fn alternate(self) -> Self {
        match self {
            TransportKind::WebSocket => TransportKind::Legacy,
            TransportKind::Legacy => TransportKind::WebSocket,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Legacy => write!(f, "legacy"),
        }
    }
}

/// Exec transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Transport tried first
    pub preferred: TransportKind,
    /// Retry once on the alternate transport after a negotiation failure
    pub fallback: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            preferred: TransportKind::WebSocket,
            fallback: true,
        }
    }
}

/// SFTP subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpSettings {
    /// Subsystem name requested by clients
    pub subsystem: String,
    /// Server program executed inside the pod
    pub command: Vec<String>,
}

impl Default for SftpSettings {
    fn default() -> Self {
        Self {
            subsystem: "sftp".to_string(),
            command: vec!["/usr/lib/sftp-server".to_string(), "-e".to_string()],
        }
    }
}
