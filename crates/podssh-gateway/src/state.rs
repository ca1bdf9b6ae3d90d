//! Global gateway state

use std::sync::Arc;

use podssh_core::config::GatewayConfig;

use crate::auth::{IdentityResolver, PasswordVerifier, RejectAllPasswords};
use crate::bridge::ExecTransport;
use crate::command::CommandResolver;
use crate::connection::ConnectionRegistry;
use crate::directory::ClusterDirectory;
use crate::ratelimit::RateLimiter;
use crate::session::SessionOrchestrator;

/// State shared by every connection
pub struct GatewayState {
    /// Configuration
    pub config: GatewayConfig,
    /// Admission limiter keyed by source address
    pub limiter: Arc<RateLimiter>,
    /// Login to identity resolution
    pub identities: IdentityResolver,
    /// Password hook, consulted only when password auth is enabled
    pub passwords: Arc<dyn PasswordVerifier>,
    /// Session runner
    pub sessions: SessionOrchestrator,
    /// Live connections
    pub connections: ConnectionRegistry,
}

impl GatewayState {
    /// Wire up the gateway around a cluster directory and exec transport
    pub fn new(
        config: GatewayConfig,
        directory: Arc<dyn ClusterDirectory>,
        transport: Arc<dyn ExecTransport>,
    ) -> Self {
        let identities = IdentityResolver::new(
            Arc::clone(&directory),
            config.default_namespace.clone(),
            config.annotations.authorized_key.clone(),
        );
        let sessions = SessionOrchestrator::new(
            directory,
            CommandResolver::new(&config.annotations),
            transport,
        );

        Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            identities,
            passwords: Arc::new(RejectAllPasswords),
            sessions,
            connections: ConnectionRegistry::new(),
            config,
        }
    }

    /// Replace the password hook
    pub fn with_password_verifier(mut self, verifier: Arc<dyn PasswordVerifier>) -> Self {
        self.passwords = verifier;
        self
    }
}
