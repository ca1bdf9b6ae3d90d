//! Exec through a direct HTTP/1.1 upgrade
//!
//! Talks to the API server without any proxy, negotiating the
//! `v5.channel.k8s.io` or `v4.channel.k8s.io` subprotocol itself and
//! framing channels with `podssh-protocol`. Useful when the cluster
//! client's WebSocket exec cannot get through an HTTPS proxy.
//!
//! Authenticates with the bearer token or client certificate from the
//! cluster configuration.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt};
use futures::{SinkExt, Stream};
use reqwest::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use podssh_core::config::TransportKind;
use podssh_core::TransportError;
use podssh_protocol::{
    channel, ChannelFrame, ProtocolError, RemoteStatus, TerminalSize, SUBPROTOCOL_V4,
    SUBPROTOCOL_V5,
};

use super::{
    is_rejection_status, ExecOutput, ExecRequest, ExecSession, ExecStream, ExecTransport,
    OUTPUT_QUEUE_DEPTH,
};

type Socket = WebSocketStream<reqwest::Upgraded>;

/// Transport performing its own exec upgrade
pub struct LegacyTransport {
    base_url: String,
    http: reqwest::Client,
    token: Option<SecretString>,
    token_file: Option<PathBuf>,
}

impl LegacyTransport {
    /// Build from the gateway's cluster configuration.
    ///
    /// Needs a bearer token (inline or from a token file) or a client
    /// certificate; exec plugins and auth providers are not supported.
    pub fn from_config(config: &kube::Config) -> Result<Self, TransportError> {
        let auth = &config.auth_info;
        let identity = client_identity(auth)?;
        let token = auth.token.clone();
        let token_file = auth.token_file.as_ref().map(PathBuf::from);

        if identity.is_none() && token.is_none() && token_file.is_none() {
            return Err(TransportError::Config(
                "Legacy transport needs a bearer token or a client certificate".into(),
            ));
        }

        let mut builder = reqwest::Client::builder().http1_only().no_proxy();

        for der in config.root_cert.iter().flatten() {
            let cert = reqwest::Certificate::from_der(der)
                .map_err(|e| TransportError::Config(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }

        let http = builder.build().map_err(|e| {
            TransportError::Config(format!("Failed to create upgrade client: {}", e))
        })?;

        Ok(Self {
            base_url: config.cluster_url.to_string().trim_end_matches('/').to_string(),
            http,
            token,
            token_file,
        })
    }

    fn exec_url(&self, request: &ExecRequest) -> Result<Url, TransportError> {
        let mut url = Url::parse(&format!(
            "{}/api/v1/namespaces/{}/pods/{}/exec",
            self.base_url, request.namespace, request.pod
        ))
        .map_err(|e| TransportError::Config(format!("Invalid exec URL: {}", e)))?;

        {
            let mut query = url.query_pairs_mut();
            for arg in &request.command {
                query.append_pair("command", arg);
            }
            query
                .append_pair("stdin", "true")
                .append_pair("stdout", "true")
                .append_pair("stderr", bool_param(request.stderr()))
                .append_pair("tty", bool_param(request.tty));
        }

        Ok(url)
    }

    /// Token for the next request; token files are re-read so rotated
    /// tokens are picked up
    async fn bearer_token(&self) -> Result<Option<String>, TransportError> {
        if let Some(token) = &self.token {
            return Ok(Some(token.expose_secret().to_string()));
        }
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            TransportError::Config(format!("Failed to read token {:?}: {}", path, e))
        })?;
        Ok(Some(token.trim().to_string()))
    }
}

#[async_trait]
impl ExecTransport for LegacyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Legacy
    }

    async fn open(&self, request: &ExecRequest) -> Result<ExecSession, TransportError> {
        let url = self.exec_url(request)?;
        let key = generate_key();

        let mut builder = self
            .http
            .get(url)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, &key)
            .header(SEC_WEBSOCKET_PROTOCOL, OFFERED_PROTOCOLS)
            .header("Impersonate-User", &request.impersonate);
        if let Some(token) = self.bearer_token().await? {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(if is_rejection_status(status.as_u16()) {
                TransportError::Api {
                    code: status.as_u16(),
                    message: body,
                }
            } else {
                TransportError::Upgrade(format!(
                    "API server returned {} instead of 101: {}",
                    status, body
                ))
            });
        }

        let accept = response
            .headers()
            .get(SEC_WEBSOCKET_ACCEPT)
            .and_then(|v| v.to_str().ok());
        if accept != Some(derive_accept_key(key.as_bytes()).as_str()) {
            return Err(TransportError::Upgrade("Sec-WebSocket-Accept mismatch".into()));
        }

        let half_close = supports_half_close(
            response
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
        )?;

        let upgraded = response
            .upgrade()
            .await
            .map_err(|e| TransportError::Upgrade(e.to_string()))?;
        let socket = WebSocketStream::from_raw_socket(upgraded, Role::Client, None).await;

        Ok(FramedStream::start(socket, half_close))
    }
}

/// Subprotocols offered, most capable first
const OFFERED_PROTOCOLS: &str = "v5.channel.k8s.io, v4.channel.k8s.io";

/// Check the negotiated subprotocol; only v5 can half-close stdin
fn supports_half_close(protocol: Option<&str>) -> Result<bool, TransportError> {
    match protocol {
        Some(SUBPROTOCOL_V5) => Ok(true),
        Some(SUBPROTOCOL_V4) => Ok(false),
        other => Err(TransportError::Upgrade(format!(
            "Server negotiated subprotocol {:?}",
            other
        ))),
    }
}

/// Client certificate identity from inline data or files
fn client_identity(
    auth: &kube::config::AuthInfo,
) -> Result<Option<reqwest::Identity>, TransportError> {
    let cert = pem_material(
        "client certificate",
        auth.client_certificate_data.as_deref(),
        auth.client_certificate.as_deref(),
    )?;
    let key = pem_material(
        "client key",
        auth.client_key_data.as_ref().map(|k| k.expose_secret()),
        auth.client_key.as_deref(),
    )?;

    match (cert, key) {
        (None, None) => Ok(None),
        (Some(mut pem), Some(key)) => {
            pem.push(b'\n');
            pem.extend_from_slice(&key);
            reqwest::Identity::from_pem(&pem)
                .map(Some)
                .map_err(|e| TransportError::Config(format!("Invalid client certificate: {}", e)))
        }
        _ => Err(TransportError::Config(
            "Client certificate and key must be configured together".into(),
        )),
    }
}

/// PEM bytes from base64 `data`, else read from `path`
fn pem_material(
    what: &str,
    data: Option<&str>,
    path: Option<&str>,
) -> Result<Option<Vec<u8>>, TransportError> {
    if let Some(data) = data {
        return STANDARD
            .decode(data.trim())
            .map(Some)
            .map_err(|e| TransportError::Config(format!("Invalid {} data: {}", what, e)));
    }

    match path {
        Some(path) => std::fs::read(path).map(Some).map_err(|e| {
            TransportError::Config(format!("Failed to read {} {:?}: {}", what, path, e))
        }),
        None => Ok(None),
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

struct FramedStream {
    sink: SplitSink<Socket, Message>,
    reader: JoinHandle<Result<Option<RemoteStatus>, TransportError>>,
    stdin_open: bool,
    /// Negotiated v5, which can signal end of stdin
    half_close: bool,
}

impl FramedStream {
    fn start(socket: Socket, half_close: bool) -> ExecSession {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let reader = tokio::spawn(read_frames(stream, tx));

        ExecSession {
            output: rx,
            stream: Box::new(Self {
                sink,
                reader,
                stdin_open: true,
                half_close,
            }),
        }
    }

    async fn send_frame(&mut self, frame: ChannelFrame) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame.encode().to_vec()))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

#[async_trait]
impl ExecStream for FramedStream {
    async fn send_stdin(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.stdin_open {
            return Ok(());
        }
        self.send_frame(ChannelFrame::stdin(data)).await
    }

    async fn close_stdin(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.stdin_open, false) {
            return Ok(());
        }
        // v4 has no half-close frame; the remote sees EOF only on exit
        if !self.half_close {
            return Ok(());
        }
        self.send_frame(ChannelFrame::close(channel::STDIN)).await
    }

    async fn send_resize(&mut self, size: TerminalSize) -> Result<(), TransportError> {
        let frame = size
            .to_frame()
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        self.send_frame(frame).await
    }

    async fn finalize(mut self: Box<Self>) -> Result<RemoteStatus, TransportError> {
        let status = (&mut self.reader)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))??;
        let _ = self.sink.close().await;
        Ok(status.unwrap_or_else(RemoteStatus::success))
    }

    fn abort(self: Box<Self>) {
        self.reader.abort();
    }
}

/// Demultiplex server frames until the socket closes.
///
/// Returns the status document from the error channel, if one was sent.
async fn read_frames<S, E>(
    mut stream: S,
    tx: mpsc::Sender<ExecOutput>,
) -> Result<Option<RemoteStatus>, TransportError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut status = None;

    while let Some(message) = stream.next().await {
        let data = match message.map_err(|e| TransportError::Stream(e.to_string()))? {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match ChannelFrame::decode(&data) {
            Ok(frame) => frame,
            Err(ProtocolError::EmptyFrame) => continue,
            Err(e) => return Err(TransportError::Stream(e.to_string())),
        };

        let output = match frame.channel {
            channel::STDOUT => ExecOutput::Stdout(frame.payload),
            channel::STDERR => ExecOutput::Stderr(frame.payload),
            channel::ERROR => {
                let doc = RemoteStatus::from_json(&frame.payload)
                    .map_err(|e| TransportError::Stream(e.to_string()))?;
                status = Some(doc);
                continue;
            }
            other => {
                tracing::trace!("Ignoring frame on channel {}", other);
                continue;
            }
        };

        if tx.send(output).await.is_err() {
            break;
        }
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn config() -> kube::Config {
        kube::Config::new("https://10.0.0.1:6443/".parse().unwrap())
    }

    fn transport() -> LegacyTransport {
        let mut config = config();
        config.auth_info.token = Some(SecretString::from("t0ken".to_string()));
        LegacyTransport::from_config(&config).unwrap()
    }

    fn binary(channel_id: u8, payload: &[u8]) -> Result<Message, Infallible> {
        let frame = ChannelFrame::new(channel_id, payload.to_vec());
        Ok(Message::Binary(frame.encode().to_vec()))
    }

    #[test]
    fn test_exec_url_carries_command_and_flags() {
        let request = ExecRequest {
            impersonate: "system:serviceaccount:prod:alice".into(),
            namespace: "prod".into(),
            pod: "web-1".into(),
            command: vec!["sh".into(), "-c".into(), "echo hi".into()],
            tty: true,
        };

        let url = transport().exec_url(&request).unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/prod/pods/web-1/exec");

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let commands: Vec<&str> = pairs
            .iter()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(commands, vec!["sh", "-c", "echo hi"]);
        assert!(pairs.contains(&("tty".into(), "true".into())));
        assert!(pairs.contains(&("stderr".into(), "false".into())));
    }

    #[tokio::test]
    async fn test_inline_token_is_used() {
        assert_eq!(
            transport().bearer_token().await.unwrap().as_deref(),
            Some("t0ken")
        );
    }

    #[tokio::test]
    async fn test_token_file_is_read_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();

        let mut config = config();
        config.auth_info.token_file = Some(path.to_string_lossy().into_owned());
        let transport = LegacyTransport::from_config(&config).unwrap();
        assert_eq!(transport.bearer_token().await.unwrap().as_deref(), Some("first"));

        std::fs::write(&path, "rotated").unwrap();
        assert_eq!(transport.bearer_token().await.unwrap().as_deref(), Some("rotated"));
    }

    #[test]
    fn test_missing_credentials_are_rejected() {
        assert!(matches!(
            LegacyTransport::from_config(&config()),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_certificate_without_key_is_rejected() {
        let mut config = config();
        config.auth_info.client_certificate_data =
            Some(STANDARD.encode("-----BEGIN CERTIFICATE-----"));

        assert!(matches!(
            LegacyTransport::from_config(&config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_undecodable_key_data_is_rejected() {
        let mut config = config();
        config.auth_info.token = Some(SecretString::from("t0ken".to_string()));
        config.auth_info.client_key_data = Some(SecretString::from("%%%".to_string()));

        assert!(matches!(
            LegacyTransport::from_config(&config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_v5_enables_half_close() {
        assert!(OFFERED_PROTOCOLS.starts_with(SUBPROTOCOL_V5));
        assert!(supports_half_close(Some(SUBPROTOCOL_V5)).unwrap());
        assert!(!supports_half_close(Some(SUBPROTOCOL_V4)).unwrap());
        assert!(matches!(
            supports_half_close(Some("base64.channel.k8s.io")),
            Err(TransportError::Upgrade(_))
        ));
        assert!(matches!(
            supports_half_close(None),
            Err(TransportError::Upgrade(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frames_demultiplexes() {
        let status = br#"{"status":"Failure","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"2"}]}}"#;
        let messages = futures::stream::iter(vec![
            binary(channel::STDOUT, b""),
            binary(channel::STDOUT, b"out"),
            binary(channel::STDERR, b"err"),
            binary(channel::ERROR, status),
            Ok(Message::Close(None)),
        ]);

        let (tx, mut rx) = mpsc::channel(8);
        let result = read_frames(messages, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(ExecOutput::Stdout(Bytes::new())));
        assert_eq!(rx.recv().await, Some(ExecOutput::Stdout(Bytes::from_static(b"out"))));
        assert_eq!(rx.recv().await, Some(ExecOutput::Stderr(Bytes::from_static(b"err"))));
        assert_eq!(rx.recv().await, None);
        assert_eq!(result.map(|s| s.exit_code()), Some(2));
    }

    #[tokio::test]
    async fn test_read_frames_without_status() {
        let messages = futures::stream::iter(vec![binary(channel::STDOUT, b"done")]);
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(read_frames(messages, tx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frames_rejects_garbage_status() {
        let messages = futures::stream::iter(vec![binary(channel::ERROR, b"not json")]);
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            read_frames(messages, tx).await,
            Err(TransportError::Stream(_))
        ));
    }
}
