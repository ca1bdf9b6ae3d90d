//! In-memory transport playing back scripted sessions
//!
//! Stands in for a cluster in unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use podssh_core::config::TransportKind;
use podssh_core::TransportError;
use podssh_protocol::{RemoteStatus, TerminalSize};

use super::{ExecOutput, ExecRequest, ExecSession, ExecStream, ExecTransport, OUTPUT_QUEUE_DEPTH};

/// What a scripted stream saw from the bridge
#[derive(Debug, Default)]
pub struct StreamRecord {
    pub stdin: Vec<u8>,
    pub stdin_closed: bool,
    pub resizes: Vec<TerminalSize>,
    pub aborted: bool,
}

/// A scripted remote process
#[derive(Debug)]
pub struct ScriptedStream {
    output: Vec<ExecOutput>,
    status: RemoteStatus,
    finalize_error: Option<TransportError>,
    stdin_error: Option<TransportError>,
    wait_for_stdin_close: bool,
    record: Arc<Mutex<StreamRecord>>,
}

impl Default for ScriptedStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedStream {
    /// A process that exits cleanly without output
    pub fn new() -> Self {
        Self {
            output: Vec::new(),
            status: RemoteStatus::success(),
            finalize_error: None,
            stdin_error: None,
            wait_for_stdin_close: false,
            record: Arc::new(Mutex::new(StreamRecord::default())),
        }
    }

    pub fn stdout(mut self, data: impl Into<Bytes>) -> Self {
        self.output.push(ExecOutput::Stdout(data.into()));
        self
    }

    pub fn stderr(mut self, data: impl Into<Bytes>) -> Self {
        self.output.push(ExecOutput::Stderr(data.into()));
        self
    }

    /// Exit with the given code
    pub fn exit_code(mut self, code: u32) -> Self {
        self.status = if code == 0 {
            RemoteStatus::success()
        } else {
            let doc = serde_json::json!({
                "status": "Failure",
                "reason": "NonZeroExitCode",
                "details": {"causes": [{"reason": "ExitCode", "message": code.to_string()}]},
            });
            serde_json::from_value(doc).unwrap_or_default()
        };
        self
    }

    /// Fail after the output has drained
    pub fn fail_with(mut self, err: TransportError) -> Self {
        self.finalize_error = Some(err);
        self
    }

    /// Fail the first stdin write
    pub fn fail_stdin_with(mut self, err: TransportError) -> Self {
        self.stdin_error = Some(err);
        self
    }

    /// Keep the output open until the bridge closes stdin
    pub fn wait_for_stdin_close(mut self) -> Self {
        self.wait_for_stdin_close = true;
        self
    }

    /// Shared view of what the bridge sent
    pub fn record(&self) -> Arc<Mutex<StreamRecord>> {
        Arc::clone(&self.record)
    }

    fn start(self) -> ExecSession {
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let (closed_tx, closed_rx) = oneshot::channel();
        let output = self.output;
        let wait = self.wait_for_stdin_close;

        tokio::spawn(async move {
            for chunk in output {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if wait {
                let _ = closed_rx.await;
            }
        });

        ExecSession {
            output: rx,
            stream: Box::new(PlaybackStream {
                status: self.status,
                finalize_error: self.finalize_error,
                stdin_error: self.stdin_error,
                record: self.record,
                closed: Some(closed_tx),
            }),
        }
    }
}

struct PlaybackStream {
    status: RemoteStatus,
    finalize_error: Option<TransportError>,
    stdin_error: Option<TransportError>,
    record: Arc<Mutex<StreamRecord>>,
    closed: Option<oneshot::Sender<()>>,
}

impl PlaybackStream {
    fn with_record(&self, f: impl FnOnce(&mut StreamRecord)) {
        if let Ok(mut record) = self.record.lock() {
            f(&mut record);
        }
    }
}

#[async_trait]
impl ExecStream for PlaybackStream {
    async fn send_stdin(&mut self, data: Bytes) -> Result<(), TransportError> {
        if let Some(err) = self.stdin_error.take() {
            return Err(err);
        }
        self.with_record(|r| r.stdin.extend_from_slice(&data));
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), TransportError> {
        self.with_record(|r| r.stdin_closed = true);
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
        Ok(())
    }

    async fn send_resize(&mut self, size: TerminalSize) -> Result<(), TransportError> {
        self.with_record(|r| r.resizes.push(size));
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<RemoteStatus, TransportError> {
        match self.finalize_error {
            Some(err) => Err(err),
            None => Ok(self.status),
        }
    }

    fn abort(self: Box<Self>) {
        self.with_record(|r| r.aborted = true);
    }
}

/// Transport handing out scripted outcomes in order
pub struct ScriptedTransport {
    kind: TransportKind,
    outcomes: Mutex<VecDeque<Result<ScriptedStream, TransportError>>>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            outcomes: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful open
    pub fn push_stream(&self, stream: ScriptedStream) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(Ok(stream));
        }
    }

    /// Queue a failed open
    pub fn push_error(&self, err: TransportError) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(Err(err));
        }
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of open attempts
    pub fn attempts(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ExecTransport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, request: &ExecRequest) -> Result<ExecSession, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front());

        match outcome {
            Some(Ok(stream)) => Ok(stream.start()),
            Some(Err(err)) => Err(err),
            None => Err(TransportError::Config(format!(
                "no scripted outcome left for {} transport",
                self.kind
            ))),
        }
    }
}
