//! Exec through the cluster client's WebSocket support
//!
//! Every stream uses a fresh client built from the gateway's credentials
//! with the impersonation user set, so the API server authorizes the exec
//! as the principal's service account.

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::client::UpgradeConnectionError;
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use podssh_core::config::TransportKind;
use podssh_core::TransportError;
use podssh_protocol::{RemoteStatus, TerminalSize};

use super::{
    is_rejection_status, ExecOutput, ExecRequest, ExecSession, ExecStream, ExecTransport,
    OUTPUT_QUEUE_DEPTH,
};

/// Transport backed by `kube`'s exec subresource support
pub struct WebSocketTransport {
    base: kube::Config,
}

impl WebSocketTransport {
    /// Create a transport from the gateway's own cluster configuration
    pub fn new(base: kube::Config) -> Self {
        Self { base }
    }

    fn impersonated_client(&self, user: &str) -> Result<Client, TransportError> {
        let mut config = self.base.clone();
        config.auth_info.impersonate = Some(user.to_string());
        Client::try_from(config).map_err(|e| TransportError::Config(e.to_string()))
    }
}

#[async_trait]
impl ExecTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, request: &ExecRequest) -> Result<ExecSession, TransportError> {
        let client = self.impersonated_client(&request.impersonate)?;
        let pods: Api<Pod> = Api::namespaced(client, &request.namespace);

        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(request.stderr())
            .tty(request.tty);

        let attached = pods
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(classify)?;

        Ok(AttachedStream::start(attached))
    }
}

/// Map a client error onto the transport taxonomy
pub(crate) fn classify(err: kube::Error) -> TransportError {
    match err {
        kube::Error::Api(response) => TransportError::Api {
            code: response.code,
            message: response.message,
        },
        kube::Error::UpgradeConnection(UpgradeConnectionError::ProtocolSwitch(status))
            if is_rejection_status(status.as_u16()) =>
        {
            TransportError::Api {
                code: status.as_u16(),
                message: status.to_string(),
            }
        }
        kube::Error::UpgradeConnection(e) => TransportError::Upgrade(e.to_string()),
        e @ (kube::Error::ProxyProtocolUnsupported { .. }
        | kube::Error::ProxyProtocolDisabled { .. }) => TransportError::Proxy(e.to_string()),
        e => TransportError::Connect(e.to_string()),
    }
}

struct AttachedStream {
    stdin: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    resize: Option<futures::channel::mpsc::Sender<kube::api::TerminalSize>>,
    readers: Vec<JoinHandle<()>>,
    attached: AttachedProcess,
}

impl AttachedStream {
    fn start(mut attached: AttachedProcess) -> ExecSession {
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let mut readers = Vec::new();

        if let Some(stdout) = attached.stdout() {
            readers.push(tokio::spawn(forward(stdout, tx.clone(), ExecOutput::Stdout)));
        }
        if let Some(stderr) = attached.stderr() {
            readers.push(tokio::spawn(forward(stderr, tx.clone(), ExecOutput::Stderr)));
        }
        drop(tx);

        let stdin = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn AsyncWrite + Unpin + Send>);
        let resize = attached.terminal_size();

        ExecSession {
            output: rx,
            stream: Box::new(Self {
                stdin,
                resize,
                readers,
                attached,
            }),
        }
    }
}

#[async_trait]
impl ExecStream for AttachedStream {
    async fn send_stdin(&mut self, data: Bytes) -> Result<(), TransportError> {
        let Some(writer) = self.stdin.as_mut() else {
            return Ok(());
        };
        writer
            .write_all(&data)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    async fn close_stdin(&mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.stdin.take() {
            writer
                .shutdown()
                .await
                .map_err(|e| TransportError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_resize(&mut self, size: TerminalSize) -> Result<(), TransportError> {
        if let Some(tx) = self.resize.as_mut() {
            let size = kube::api::TerminalSize {
                width: size.width,
                height: size.height,
            };
            // The receiver only goes away with the connection itself
            if tx.send(size).await.is_err() {
                self.resize = None;
            }
        }
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<RemoteStatus, TransportError> {
        let Self {
            stdin,
            resize,
            readers,
            mut attached,
        } = *self;

        for reader in readers {
            let _ = reader.await;
        }
        drop(stdin);
        drop(resize);

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        match status {
            Some(status) => {
                let doc = serde_json::to_vec(&status)
                    .map_err(|e| TransportError::Stream(e.to_string()))?;
                RemoteStatus::from_json(&doc).map_err(|e| TransportError::Stream(e.to_string()))
            }
            None => Ok(RemoteStatus::success()),
        }
    }

    fn abort(self: Box<Self>) {
        for reader in &self.readers {
            reader.abort();
        }
        self.attached.abort();
    }
}

async fn forward<R, F>(mut reader: R, tx: mpsc::Sender<ExecOutput>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(Bytes) -> ExecOutput,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Exec output reader stopped: {}", e);
                break;
            }
        }
    }
}
