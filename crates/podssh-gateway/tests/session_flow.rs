//! End-to-end session flow against an in-memory cluster

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podssh_core::config::{GatewayConfig, TransportKind};
use podssh_core::{AuthError, SessionError, TransportError};
use podssh_gateway::bridge::{
    ExecOutput, ExecRequest, ExecSession, ExecStream, ExecTransport, FallbackTransport,
    SessionOutput,
};
use podssh_gateway::connection::ConnectionContext;
use podssh_gateway::directory::{MemoryDirectory, ObjectKind};
use podssh_gateway::resize::resize_channel;
use podssh_gateway::session::{SessionChannel, SessionKind, SessionRequest};
use podssh_gateway::GatewayState;
use podssh_protocol::{RemoteStatus, TerminalSize};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;

const KEY_ANNOTATION: &str = "ssh.barpilot.io/publickey";

/// What the fake cluster does with the next exec call
enum Canned {
    Refuse(TransportError),
    Run { stdout: &'static str, exit: u32 },
}

/// Exec endpoint answering from a queue of canned outcomes
struct FakeCluster {
    kind: TransportKind,
    canned: Mutex<VecDeque<Canned>>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl FakeCluster {
    fn new(kind: TransportKind, canned: impl IntoIterator<Item = Canned>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            canned: Mutex::new(canned.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecTransport for FakeCluster {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, request: &ExecRequest) -> Result<ExecSession, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let canned = self.canned.lock().unwrap().pop_front();

        match canned {
            Some(Canned::Run { stdout, exit }) => {
                let (tx, rx) = mpsc::channel(4);
                tx.send(ExecOutput::Stdout(Bytes::from_static(stdout.as_bytes())))
                    .await
                    .unwrap();
                Ok(ExecSession {
                    output: rx,
                    stream: Box::new(FinishedProcess { exit }),
                })
            }
            Some(Canned::Refuse(err)) => Err(err),
            None => Err(TransportError::Connect("no canned outcome".into())),
        }
    }
}

/// A remote process that already wrote its output and exited
struct FinishedProcess {
    exit: u32,
}

#[async_trait]
impl ExecStream for FinishedProcess {
    async fn send_stdin(&mut self, _data: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_resize(&mut self, _size: TerminalSize) -> Result<(), TransportError> {
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<RemoteStatus, TransportError> {
        if self.exit == 0 {
            return Ok(RemoteStatus::success());
        }
        let doc = format!(
            r#"{{"status":"Failure","reason":"NonZeroExitCode","details":{{"causes":[{{"reason":"ExitCode","message":"{}"}}]}}}}"#,
            self.exit
        );
        RemoteStatus::from_json(doc.as_bytes()).map_err(|e| TransportError::Stream(e.to_string()))
    }

    fn abort(self: Box<Self>) {}
}

#[derive(Default)]
struct Recorder {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: Option<u32>,
}

#[async_trait]
impl SessionOutput for Recorder {
    async fn stdout(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stdout.extend_from_slice(data);
        Ok(())
    }

    async fn stderr(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stderr.extend_from_slice(data);
        Ok(())
    }
}

#[async_trait]
impl SessionChannel for Recorder {
    async fn exit(&mut self, code: u32) {
        self.exit = Some(code);
    }
}

fn client_key() -> PublicKey {
    KeyPair::generate_ed25519()
        .unwrap()
        .clone_public_key()
        .unwrap()
}

fn cluster(key: &PublicKey) -> Arc<MemoryDirectory> {
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert(
        ObjectKind::ServiceAccount,
        "prod",
        "alice",
        [(
            KEY_ANNOTATION.to_string(),
            format!("{} {} alice@laptop", key.name(), key.public_key_base64()),
        )],
    );
    directory.insert(
        ObjectKind::Pod,
        "prod",
        "web-1",
        Vec::<(String, String)>::new(),
    );
    directory
}

fn gateway(directory: Arc<MemoryDirectory>, transport: Arc<FakeCluster>) -> GatewayState {
    GatewayState::new(GatewayConfig::default(), directory, transport)
}

fn context() -> ConnectionContext {
    ConnectionContext::new("192.0.2.10:51515".parse().unwrap(), &CancellationToken::new())
}

fn closed_stdin() -> mpsc::Receiver<Bytes> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

#[tokio::test]
async fn test_login_to_exec_request() {
    let key = client_key();
    let transport = FakeCluster::new(
        TransportKind::WebSocket,
        [Canned::Run {
            stdout: "hello\n",
            exit: 0,
        }],
    );
    let state = gateway(cluster(&key), Arc::clone(&transport));
    let context = context();

    let identity = context
        .identity("alice@web-1.prod", &state.identities)
        .await
        .unwrap();
    assert!(identity.accepts_key(&key));
    context.mark_authenticated();

    assert_eq!(identity.principal(), "alice");
    assert_eq!(identity.workload(), "web-1");
    assert_eq!(identity.namespace(), "prod");

    let request = SessionRequest {
        identity,
        kind: SessionKind::Exec,
        command: vec!["bash".to_string()],
        tty: false,
    };
    let mut recorder = Recorder::default();
    let code = state
        .sessions
        .run(
            request,
            closed_stdin(),
            &mut recorder,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(recorder.stdout, b"hello\n");
    assert_eq!(recorder.exit, Some(0));
    assert!(!context.should_penalize());

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].command, vec!["bash"]);
    assert_eq!(requests[0].namespace, "prod");
    assert_eq!(requests[0].pod, "web-1");
    assert_eq!(requests[0].impersonate, "system:serviceaccount:prod:alice");
    assert!(!requests[0].tty);
}

#[tokio::test]
async fn test_wrong_key_is_refused() {
    let key = client_key();
    let state = gateway(
        cluster(&key),
        FakeCluster::new(TransportKind::WebSocket, []),
    );

    let identity = context()
        .identity("alice@web-1.prod", &state.identities)
        .await
        .unwrap();

    assert!(!identity.accepts_key(&client_key()));
}

#[tokio::test]
async fn test_unknown_account_fails_authentication() {
    let key = client_key();
    let state = gateway(
        cluster(&key),
        FakeCluster::new(TransportKind::WebSocket, []),
    );
    let context = context();

    let err = context
        .identity("mallory@web-1.prod", &state.identities)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::IdentityNotFound { .. }));
    assert!(context.should_penalize());
}

#[tokio::test]
async fn test_missing_pod_reports_generic_failure() {
    let key = client_key();
    let transport = FakeCluster::new(TransportKind::WebSocket, []);
    let state = gateway(cluster(&key), Arc::clone(&transport));

    let identity = context()
        .identity("alice@web-9.prod", &state.identities)
        .await
        .unwrap();
    let request = SessionRequest {
        identity,
        kind: SessionKind::Shell,
        command: Vec::new(),
        tty: false,
    };

    let mut recorder = Recorder::default();
    let result = state
        .sessions
        .run(
            request,
            closed_stdin(),
            &mut recorder,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(SessionError::WorkloadNotFound { .. })));
    assert_eq!(recorder.stderr, b"can't find destination");
    assert!(recorder.stdout.is_empty());
    assert_eq!(recorder.exit, Some(1));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_fallback_and_resize_in_tty_session() {
    let key = client_key();
    let primary = FakeCluster::new(
        TransportKind::WebSocket,
        [Canned::Refuse(TransportError::Upgrade("bad handshake".into()))],
    );
    let secondary = FakeCluster::new(
        TransportKind::Legacy,
        [Canned::Run {
            stdout: "$ ",
            exit: 3,
        }],
    );

    let transport = Arc::new(FallbackTransport::new(
        Arc::clone(&primary) as _,
        Arc::clone(&secondary) as _,
    ));
    let state = GatewayState::new(GatewayConfig::default(), cluster(&key), transport);

    let identity = context()
        .identity("alice@web-1.prod", &state.identities)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (resize_tx, adapter) = resize_channel(cancel.clone());
    resize_tx.try_send(TerminalSize::new(80, 24)).unwrap();
    drop(resize_tx);

    let (stdin_tx, stdin_rx) = mpsc::channel(4);
    stdin_tx.send(Bytes::from_static(b"exit 3\n")).await.unwrap();
    drop(stdin_tx);

    let request = SessionRequest {
        identity,
        kind: SessionKind::Shell,
        command: Vec::new(),
        tty: true,
    };
    let mut recorder = Recorder::default();
    let code = state
        .sessions
        .run(request, stdin_rx, &mut recorder, Some(adapter), &cancel)
        .await
        .unwrap();

    assert_eq!(code, 3);
    assert_eq!(recorder.exit, Some(3));
    assert_eq!(recorder.stdout, b"$ ");
    assert_eq!(primary.requests().len(), 1);
    assert_eq!(secondary.requests().len(), 1);
    assert!(secondary.requests()[0].tty);
}
