//! SSH connection handler
//!
//! Implements the russh server handler: authenticates logins against
//! their service accounts and turns each session channel into a remote
//! process via the session orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::PublicKey;

use podssh_core::config::AuthSettings;
use podssh_core::SessionError;
use podssh_protocol::TerminalSize;

use super::channels::{subsystem_command, ChannelTable, StdinDelivery};
use crate::command::tokenize_exec;
use crate::connection::ConnectionContext;
use crate::session::{ChannelOutput, SessionKind};
use crate::state::GatewayState;

/// Handler for a single SSH client connection
pub struct ConnectionHandler {
    /// Shared gateway state
    state: Arc<GatewayState>,
    /// State of this connection, shared with the listener
    context: Arc<ConnectionContext>,
    /// Open session channels
    channels: ChannelTable<ChannelId>,
    /// Session handle for sending data (captured when a channel opens)
    handle: Option<Handle>,
}

impl ConnectionHandler {
    /// Create a handler for an accepted connection
    pub fn new(state: Arc<GatewayState>, context: Arc<ConnectionContext>) -> Self {
        Self {
            state,
            context,
            channels: ChannelTable::new(),
            handle: None,
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Refuse a session with the generic message and a failed exit status
    fn refuse_session(&self, channel: ChannelId, session: &mut Session) {
        let _ = session.extended_data(
            channel,
            1,
            CryptoVec::from_slice(SessionError::CLIENT_MESSAGE.as_bytes()),
        );
        let _ = session.exit_status_request(channel, SessionError::EXIT_STATUS);
        let _ = session.eof(channel);
        let _ = session.close(channel);
    }

    /// Start the remote process for a channel
    fn start_session(
        &mut self,
        channel: ChannelId,
        kind: SessionKind,
        command: Vec<String>,
        session: &mut Session,
    ) {
        let (Some(identity), Some(handle)) =
            (self.context.resolved_identity(), self.handle.clone())
        else {
            let _ = session.channel_failure(channel);
            return;
        };

        let Some(pending) = self.channels.start(channel, identity, kind, command) else {
            let _ = session.channel_failure(channel);
            return;
        };

        let state = Arc::clone(&self.state);
        let conn_id = self.context.conn_id;

        let _ = session.channel_success(channel);

        tokio::spawn(async move {
            let mut output = ChannelOutput::new(handle, channel);
            let _ = state
                .sessions
                .run(
                    pending.request,
                    pending.stdin,
                    &mut output,
                    pending.resize,
                    &pending.cancel,
                )
                .await;
            tracing::debug!(%conn_id, ?channel, "Session task finished");
        });
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Ends every session still running on this connection
        self.context.cancel.cancel();
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Handle public key authentication
    ///
    /// The login names a service account; the key must match the one in
    /// that account's authorized-key annotation.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let conn_id = self.context.conn_id;
        let peer = self.context.peer;

        match self
            .context
            .verify_key(user, public_key, &self.state.identities)
            .await
        {
            Ok(true) => {
                tracing::info!(
                    %conn_id,
                    %peer,
                    user,
                    fingerprint = %public_key.fingerprint(),
                    "Public key accepted"
                );
                Ok(Auth::Accept)
            }
            Ok(false) => {
                tracing::debug!(
                    %conn_id,
                    %peer,
                    user,
                    fingerprint = %public_key.fingerprint(),
                    "Public key does not match authorized key"
                );
                Ok(Self::reject())
            }
            Err(e) => {
                tracing::warn!(%conn_id, %peer, user, error = %e, "Authentication rejected");
                Ok(Self::reject())
            }
        }
    }

    /// Handle password authentication through the configured hook
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let conn_id = self.context.conn_id;

        if !self.state.config.auth.password_enabled {
            return Ok(Self::reject());
        }

        let identity = match self.context.identity(user, &self.state.identities).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(%conn_id, user, error = %e, "Authentication rejected");
                return Ok(Self::reject());
            }
        };

        if self.state.passwords.verify(&identity, password) {
            tracing::info!(%conn_id, user, "Password accepted");
            self.context.mark_authenticated();
            return Ok(Auth::Accept);
        }

        Ok(Self::reject())
    }

    /// Handle channel open request
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.context.is_authenticated() {
            return Ok(false);
        }

        let channel_id = channel.id();
        tracing::debug!(conn_id = %self.context.conn_id, ?channel_id, "Channel opened");

        self.channels.open(channel_id, self.context.cancel.child_token());

        if self.handle.is_none() {
            self.handle = Some(session.handle());
        }

        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = TerminalSize::from_cells(col_width, row_height);
        if !self.channels.request_pty(channel, size) {
            let _ = session.channel_failure(channel);
            return Ok(());
        }

        tracing::debug!(?channel, term, col_width, row_height, "PTY requested");
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = TerminalSize::from_cells(col_width, row_height);
        self.channels.resize(channel, size);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, SessionKind::Shell, Vec::new(), session);
        Ok(())
    }

    /// Handle `ssh user@host "command"` style invocations
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match tokenize_exec(data) {
            Ok(command) => self.start_session(channel, SessionKind::Exec, command, session),
            Err(e) => {
                tracing::warn!(conn_id = %self.context.conn_id, error = %e, "Rejecting exec request");
                let _ = session.channel_success(channel);
                self.refuse_session(channel, session);
            }
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(command) = subsystem_command(&self.state.config.sftp, name) else {
            tracing::debug!(conn_id = %self.context.conn_id, subsystem = name, "Unsupported subsystem");
            let _ = session.channel_failure(channel);
            return Ok(());
        };

        self.start_session(
            channel,
            SessionKind::Subsystem(name.to_string()),
            command,
            session,
        );
        Ok(())
    }

    /// Forward client input to the remote stdin
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channels.push_stdin(channel, data) == StdinDelivery::Overflow {
            tracing::warn!(
                conn_id = %self.context.conn_id,
                ?channel,
                "Remote process stopped reading stdin, ending session"
            );
        }
        Ok(())
    }

    /// Client finished sending input
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(?channel, "Channel EOF");
        self.channels.close_stdin(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(?channel, "Channel closed");
        self.channels.close(channel);
        Ok(())
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a server configuration with the given host key
    pub fn new(host_key: russh_keys::key::KeyPair, auth: &AuthSettings) -> Self {
        let mut methods = MethodSet::PUBLICKEY;
        if auth.password_enabled {
            methods |= MethodSet::PASSWORD;
        }

        let config = russh::server::Config {
            keys: vec![host_key],
            methods,
            auth_rejection_time: auth.auth_rejection_time,
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            ..Default::default()
        };

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
