//! Session channel bookkeeping
//!
//! Tracks what each SSH session channel asked for before its session
//! starts (pty, window size) and, once started, the queues feeding the
//! remote process. Kept apart from the russh handler so the request
//! sequencing can be exercised without a socket.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use podssh_core::config::SftpSettings;
use podssh_protocol::TerminalSize;

use crate::auth::Identity;
use crate::resize::{resize_channel, ResizeAdapter};
use crate::session::{SessionKind, SessionRequest};

/// Buffered stdin chunks per session
pub const STDIN_QUEUE_DEPTH: usize = 1024;

/// Outcome of handing client input to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinDelivery {
    Queued,
    /// No session is reading; the bytes were dropped
    Discarded,
    /// The session stopped draining its stdin and was cancelled
    Overflow,
}

/// Everything needed to spawn a session for a channel
pub struct PendingSession {
    pub request: SessionRequest,
    pub stdin: mpsc::Receiver<Bytes>,
    pub resize: Option<ResizeAdapter>,
    pub cancel: CancellationToken,
}

struct ChannelState {
    /// Size from the pty request, if a pty was requested
    pty: Option<TerminalSize>,
    stdin_tx: Option<mpsc::Sender<Bytes>>,
    resize_tx: Option<mpsc::Sender<TerminalSize>>,
    /// Cancelled when the channel closes
    cancel: CancellationToken,
    started: bool,
}

/// Open session channels of one connection
pub struct ChannelTable<K> {
    channels: HashMap<K, ChannelState>,
}

impl<K> Default for ChannelTable<K> {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Copy + Debug> ChannelTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, id: K, cancel: CancellationToken) {
        self.channels.insert(
            id,
            ChannelState {
                pty: None,
                stdin_tx: None,
                resize_tx: None,
                cancel,
                started: false,
            },
        );
    }

    /// Record a pty request. Returns false for an unknown channel.
    pub fn request_pty(&mut self, id: K, size: TerminalSize) -> bool {
        match self.channels.get_mut(&id) {
            Some(state) => {
                state.pty = Some(size);
                true
            }
            None => false,
        }
    }

    /// Apply a window change, forwarding it once the session runs
    pub fn resize(&mut self, id: K, size: TerminalSize) {
        let Some(state) = self.channels.get_mut(&id) else {
            return;
        };

        match &state.resize_tx {
            Some(tx) => {
                if tx.try_send(size).is_err() {
                    tracing::debug!(channel = ?id, "Dropping window change, queue full");
                }
            }
            None => {
                if state.pty.is_some() {
                    state.pty = Some(size);
                }
            }
        }
    }

    /// Mark the channel started and hand out what its session needs.
    ///
    /// Returns `None` for an unknown channel or one already running a
    /// session. Subsystems never get a pty, even after a pty request.
    pub fn start(
        &mut self,
        id: K,
        identity: Arc<Identity>,
        kind: SessionKind,
        command: Vec<String>,
    ) -> Option<PendingSession> {
        let state = self.channels.get_mut(&id)?;
        if state.started {
            tracing::warn!(channel = ?id, "Session already started on channel");
            return None;
        }
        state.started = true;

        let pty = match kind {
            SessionKind::Subsystem(_) => None,
            _ => state.pty,
        };

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE_DEPTH);
        state.stdin_tx = Some(stdin_tx);

        let resize = pty.map(|size| {
            let (resize_tx, adapter) = resize_channel(state.cancel.clone());
            // The remote pty starts at the size the client asked for
            let _ = resize_tx.try_send(size);
            state.resize_tx = Some(resize_tx);
            adapter
        });

        Some(PendingSession {
            request: SessionRequest {
                identity,
                kind,
                command,
                tty: pty.is_some(),
            },
            stdin: stdin_rx,
            resize,
            cancel: state.cancel.clone(),
        })
    }

    /// Queue client input without waiting.
    ///
    /// A full queue means the remote process stopped reading; the session
    /// is cancelled rather than stalling the whole connection.
    pub fn push_stdin(&mut self, id: K, data: &[u8]) -> StdinDelivery {
        let Some(state) = self.channels.get_mut(&id) else {
            return StdinDelivery::Discarded;
        };
        let Some(tx) = &state.stdin_tx else {
            return StdinDelivery::Discarded;
        };

        match tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => StdinDelivery::Queued,
            Err(TrySendError::Closed(_)) => {
                // Remote process already gone
                state.stdin_tx = None;
                StdinDelivery::Discarded
            }
            Err(TrySendError::Full(_)) => {
                state.stdin_tx = None;
                state.cancel.cancel();
                StdinDelivery::Overflow
            }
        }
    }

    /// Client sent EOF; the session sees its stdin end
    pub fn close_stdin(&mut self, id: K) {
        if let Some(state) = self.channels.get_mut(&id) {
            state.stdin_tx = None;
        }
    }

    /// Drop the channel and cancel its session
    pub fn close(&mut self, id: K) {
        if let Some(state) = self.channels.remove(&id) {
            state.cancel.cancel();
        }
    }
}

/// Program to run for a subsystem request, `None` if unsupported
pub fn subsystem_command(settings: &SftpSettings, name: &str) -> Option<Vec<String>> {
    (name == settings.subsystem).then(|| settings.command.clone())
}
