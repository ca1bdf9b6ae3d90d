//! SSH server listener
//!
//! Accepts incoming connections, holds each one back until its source
//! address is admitted by the rate limiter, then runs the SSH protocol
//! with a fresh handler.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::connection::ConnectionContext;
use crate::server::handler::{ConnectionHandler, ServerConfig};
use crate::state::GatewayState;

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// Server configuration
    config: ServerConfig,
    /// Shared gateway state
    state: Arc<GatewayState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl SshServer {
    /// Create a new SSH server
    pub fn new(host_key: KeyPair, state: Arc<GatewayState>, cancel: CancellationToken) -> Self {
        Self {
            config: ServerConfig::new(host_key, &state.config.auth),
            state,
            cancel,
        }
    }

    /// Run the SSH server until the cancellation token fires
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "SSH server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer)) => self.handle_connection(socket, peer),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn the task serving one accepted connection
    fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let context = Arc::new(ConnectionContext::new(peer, &self.cancel));
        let span = tracing::info_span!("connection", conn_id = %context.conn_id, %peer);

        let config = Arc::clone(&self.config.ssh_config);
        let state = Arc::clone(&self.state);

        tokio::spawn(
            async move {
                state.connections.insert(Arc::clone(&context));
                serve_connection(config, socket, &state, &context).await;
                state.connections.remove(&context.conn_id);
                context.cancel.cancel();

                tracing::debug!(active = state.connections.len(), "Connection closed");
            }
            .instrument(span),
        );
    }
}

/// Admit, serve and account for a single connection
async fn serve_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    state: &Arc<GatewayState>,
    context: &Arc<ConnectionContext>,
) {
    let addr = context.peer.ip();

    tokio::select! {
        _ = context.cancel.cancelled() => {
            tracing::debug!("Shutdown while waiting for admission");
            return;
        }
        _ = state.limiter.admit(addr) => {}
    }

    tracing::info!("New connection");

    let handler = ConnectionHandler::new(Arc::clone(state), Arc::clone(context));
    let penalize = match russh::server::run_stream(config, socket, handler).await {
        Ok(session) => {
            tokio::select! {
                _ = context.cancel.cancelled() => {
                    tracing::debug!("Connection cancelled");
                    false
                }
                result = session => match result {
                    Ok(()) => {
                        tracing::info!("Connection closed normally");
                        false
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Connection closed with error");
                        false
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SSH handshake failed");
            true
        }
    };

    if penalize || context.should_penalize() {
        let rate = state.limiter.penalize(addr);
        tracing::info!(%addr, rate, "Penalized source address");
    }
}

/// Load the host key, or generate an in-memory one when the file is absent
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::info!(path = %path.display(), "Loading host key");
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    tracing::warn!(
        path = %path.display(),
        "No host key found, using a generated key that changes on restart"
    );

    Ok(key)
}
