//! Session orchestration
//!
//! Resolves what to run for an authenticated session, runs it through the
//! execution bridge and reports the outcome on the channel. Failures are
//! logged in full but the client only ever sees a fixed message.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use podssh_core::SessionError;

use super::output::SessionChannel;
use crate::auth::Identity;
use crate::bridge::{execute, ExecRequest, ExecTransport};
use crate::command::CommandResolver;
use crate::directory::{ClusterDirectory, ObjectKind};
use crate::resize::ResizeAdapter;

/// How the client asked for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Shell,
    Exec,
    Subsystem(String),
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Shell => write!(f, "shell"),
            SessionKind::Exec => write!(f, "exec"),
            SessionKind::Subsystem(name) => write!(f, "subsystem:{}", name),
        }
    }
}

/// A session request from an authenticated connection
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub identity: Arc<Identity>,
    pub kind: SessionKind,
    /// Command supplied by the client, empty if none
    pub command: Vec<String>,
    pub tty: bool,
}

/// Runs sessions against the cluster
pub struct SessionOrchestrator {
    directory: Arc<dyn ClusterDirectory>,
    commands: CommandResolver,
    transport: Arc<dyn ExecTransport>,
}

impl SessionOrchestrator {
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        commands: CommandResolver,
        transport: Arc<dyn ExecTransport>,
    ) -> Self {
        Self {
            directory,
            commands,
            transport,
        }
    }

    /// Look up the target objects and build the exec request
    pub async fn prepare(&self, request: &SessionRequest) -> Result<ExecRequest, SessionError> {
        let identity = &request.identity;
        let namespace = identity.namespace();

        let pod = self
            .directory
            .get_object(ObjectKind::Pod, namespace, identity.workload())
            .await?
            .ok_or_else(|| SessionError::WorkloadNotFound {
                namespace: namespace.to_string(),
                name: identity.workload().to_string(),
            })?;

        let account = self
            .directory
            .get_object(ObjectKind::ServiceAccount, namespace, identity.principal())
            .await?
            .ok_or_else(|| SessionError::IdentityNotFound {
                namespace: namespace.to_string(),
                name: identity.principal().to_string(),
            })?;

        let command = self.commands.resolve(&request.command, &pod, &account)?;

        Ok(ExecRequest {
            impersonate: identity.impersonation_name(),
            namespace: namespace.to_string(),
            pod: identity.workload().to_string(),
            command,
            tty: request.tty,
        })
    }

    /// Run a session to completion and report its exit status.
    ///
    /// Cancelled sessions end silently; every other failure writes the
    /// generic client message and exits with a non-zero status.
    pub async fn run<C: SessionChannel>(
        &self,
        request: SessionRequest,
        stdin: mpsc::Receiver<Bytes>,
        channel: &mut C,
        resize: Option<ResizeAdapter>,
        cancel: &CancellationToken,
    ) -> Result<u32, SessionError> {
        let identity = Arc::clone(&request.identity);
        let span = tracing::info_span!(
            "session",
            user = %identity.principal(),
            namespace = %identity.namespace(),
            pod = %identity.workload(),
            kind = %request.kind,
        );

        async move {
            let result = match self.prepare(&request).await {
                Ok(exec) => {
                    tracing::info!(command = ?exec.command, tty = exec.tty, "Starting session");
                    execute(
                        self.transport.as_ref(),
                        &exec,
                        stdin,
                        &mut *channel,
                        resize,
                        cancel,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(code) => {
                    tracing::info!(exit_code = code, "Session finished");
                    channel.exit(code).await;
                    Ok(code)
                }
                Err(SessionError::Cancelled) => {
                    tracing::debug!("Session cancelled");
                    Err(SessionError::Cancelled)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Session failed");
                    let _ = channel
                        .stderr(SessionError::CLIENT_MESSAGE.as_bytes())
                        .await;
                    channel.exit(SessionError::EXIT_STATUS).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}
