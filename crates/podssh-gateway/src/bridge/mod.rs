//! Execution bridge
//!
//! Opens an impersonated exec stream into the target pod and pumps bytes
//! between it and the SSH channel until the remote process exits.
//!
//! Two transports speak the remote-command protocol: the cluster client's
//! own WebSocket exec ([`WebSocketTransport`]) and a direct HTTP/1.1
//! upgrade ([`LegacyTransport`]). [`FallbackTransport`] tries the preferred
//! one and switches to the other only when negotiation failed, so no
//! session byte is ever sent twice.

mod fallback;
mod legacy;
#[cfg(test)]
mod scripted;
mod websocket;

pub use fallback::FallbackTransport;
pub use legacy::LegacyTransport;
#[cfg(test)]
pub(crate) use scripted::{ScriptedStream, ScriptedTransport};
pub use websocket::WebSocketTransport;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podssh_core::config::{TransportKind, TransportSettings};
use podssh_core::{SessionError, TransportError};
use podssh_protocol::{RemoteStatus, TerminalSize};

use crate::resize::ResizeAdapter;

/// Buffered output chunks per stream
pub(crate) const OUTPUT_QUEUE_DEPTH: usize = 64;

/// Everything needed to start a remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// User the exec call is impersonated as
    pub impersonate: String,
    pub namespace: String,
    pub pod: String,
    pub command: Vec<String>,
    /// Allocate a remote pty; stderr is merged into stdout when set
    pub tty: bool,
}

impl ExecRequest {
    /// Whether a separate stderr stream is requested
    pub fn stderr(&self) -> bool {
        !self.tty
    }
}

/// A chunk of remote output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Input half of an established exec stream
#[async_trait]
pub trait ExecStream: Send {
    /// Forward stdin bytes
    async fn send_stdin(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Signal that no more stdin will follow
    async fn close_stdin(&mut self) -> Result<(), TransportError>;

    /// Forward a terminal size to the remote pty
    async fn send_resize(&mut self, size: TerminalSize) -> Result<(), TransportError>;

    /// Collect the final status once the output has drained
    async fn finalize(self: Box<Self>) -> Result<RemoteStatus, TransportError>;

    /// Tear the stream down without waiting for the remote process
    fn abort(self: Box<Self>);
}

/// An exec stream together with its output queue.
///
/// The queue closes once the remote side stops producing output.
pub struct ExecSession {
    pub output: mpsc::Receiver<ExecOutput>,
    pub stream: Box<dyn ExecStream>,
}

/// A way of opening exec streams
#[async_trait]
pub trait ExecTransport: Send + Sync {
    /// Which transport this is, for logging
    fn kind(&self) -> TransportKind;

    /// Negotiate a new stream.
    ///
    /// Errors returned here happen before any session byte has flowed.
    async fn open(&self, request: &ExecRequest) -> Result<ExecSession, TransportError>;
}

/// Client-facing side of a session
#[async_trait]
pub trait SessionOutput: Send {
    async fn stdout(&mut self, data: &[u8]) -> std::io::Result<()>;

    async fn stderr(&mut self, data: &[u8]) -> std::io::Result<()>;
}

/// Assemble the transport stack from settings.
///
/// The preferred transport must be usable with the cluster credentials.
/// When the alternate one is not, the gateway runs without fallback.
pub fn build_transport(
    settings: &TransportSettings,
    cluster: &kube::Config,
) -> Result<Arc<dyn ExecTransport>, TransportError> {
    let make = |kind: TransportKind| -> Result<Arc<dyn ExecTransport>, TransportError> {
        Ok(match kind {
            TransportKind::WebSocket => Arc::new(WebSocketTransport::new(cluster.clone())),
            TransportKind::Legacy => Arc::new(LegacyTransport::from_config(cluster)?),
        })
    };

    let primary = make(settings.preferred)?;
    if !settings.fallback {
        return Ok(primary);
    }

    match make(settings.preferred.alternate()) {
        Ok(secondary) => Ok(Arc::new(FallbackTransport::new(primary, secondary))),
        Err(e) => {
            tracing::warn!(
                transport = %settings.preferred.alternate(),
                error = %e,
                "Fallback transport unavailable, continuing without it"
            );
            Ok(primary)
        }
    }
}

/// HTTP statuses meaning the API server understood and refused the request
pub(crate) fn is_rejection_status(code: u16) -> bool {
    matches!(code, 401 | 403 | 404)
}

/// How the output loop of [`execute`] ended
enum Outcome {
    /// The remote side closed its output
    Drained,
    Cancelled,
    /// Writing to the client failed
    ClientGone,
    /// Forwarding stdin or resize events failed
    Input(TransportError),
}

/// Run a remote process to completion and return its exit code.
///
/// Input (stdin and, for pty sessions, resize events) is forwarded
/// concurrently with output, so a remote that stops reading stdin never
/// stops its output from reaching the client. Cancelling `cancel` aborts
/// the stream and yields [`SessionError::Cancelled`].
pub async fn execute(
    transport: &dyn ExecTransport,
    request: &ExecRequest,
    stdin: mpsc::Receiver<Bytes>,
    output: &mut dyn SessionOutput,
    resize: Option<ResizeAdapter>,
    cancel: &CancellationToken,
) -> Result<u32, SessionError> {
    let ExecSession {
        output: mut remote_output,
        mut stream,
    } = tokio::select! {
        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        opened = transport.open(request) => opened?,
    };

    tracing::debug!(
        transport = %transport.kind(),
        pod = %request.pod,
        namespace = %request.namespace,
        "Exec stream established"
    );

    let resize = resize.filter(|_| request.tty);

    let outcome = {
        let input = forward_input(stream.as_mut(), stdin, resize);
        tokio::pin!(input);
        let mut forwarding = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break Outcome::Cancelled,

                result = &mut input, if forwarding => {
                    forwarding = false;
                    if let Err(e) = result {
                        break Outcome::Input(e);
                    }
                }

                chunk = remote_output.recv() => {
                    let written = match chunk {
                        Some(ExecOutput::Stdout(data)) => output.stdout(&data).await,
                        Some(ExecOutput::Stderr(data)) => output.stderr(&data).await,
                        None => break Outcome::Drained,
                    };
                    if let Err(e) = written {
                        tracing::debug!("Client went away: {}", e);
                        break Outcome::ClientGone;
                    }
                }
            }
        }
    };

    match outcome {
        Outcome::Drained => {
            let status = stream.finalize().await?;
            Ok(status.exit_code())
        }
        Outcome::Cancelled | Outcome::ClientGone => {
            stream.abort();
            Err(SessionError::Cancelled)
        }
        Outcome::Input(e) => {
            stream.abort();
            Err(e.into())
        }
    }
}

/// Forward stdin and resize events until both sources are exhausted
async fn forward_input(
    stream: &mut dyn ExecStream,
    mut stdin: mpsc::Receiver<Bytes>,
    mut resize: Option<ResizeAdapter>,
) -> Result<(), TransportError> {
    let mut stdin_open = true;

    while stdin_open || resize.is_some() {
        tokio::select! {
            chunk = stdin.recv(), if stdin_open => match chunk {
                Some(data) => stream.send_stdin(data).await?,
                None => {
                    stdin_open = false;
                    stream.close_stdin().await?;
                }
            },

            size = next_size(resize.as_mut()), if resize.is_some() => match size {
                Some(size) => stream.send_resize(size).await?,
                None => resize = None,
            },
        }
    }

    Ok(())
}

async fn next_size(adapter: Option<&mut ResizeAdapter>) -> Option<TerminalSize> {
    match adapter {
        Some(adapter) => adapter.next().await,
        None => None,
    }
}
