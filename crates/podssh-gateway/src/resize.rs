//! Terminal resize adapter
//!
//! The SSH handler pushes window changes as they arrive; the execution
//! bridge pulls them one at a time while it streams.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podssh_protocol::TerminalSize;

/// Pending window changes kept per session
pub const RESIZE_QUEUE_DEPTH: usize = 16;

/// Create a connected sender and adapter pair
pub fn resize_channel(cancel: CancellationToken) -> (mpsc::Sender<TerminalSize>, ResizeAdapter) {
    let (tx, rx) = mpsc::channel(RESIZE_QUEUE_DEPTH);
    (tx, ResizeAdapter::new(rx, cancel))
}

/// Pull view over a stream of resize notifications
#[derive(Debug)]
pub struct ResizeAdapter {
    rx: mpsc::Receiver<TerminalSize>,
    cancel: CancellationToken,
    exhausted: bool,
}

impl ResizeAdapter {
    /// Wrap a receiver; the sequence ends when every sender is dropped or
    /// `cancel` fires
    pub fn new(rx: mpsc::Receiver<TerminalSize>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            exhausted: false,
        }
    }

    /// Wait for the next size.
    ///
    /// Returns `None` once the source is gone, and keeps returning `None`
    /// on every later call.
    pub async fn next(&mut self) -> Option<TerminalSize> {
        if self.exhausted {
            return None;
        }

        let size = tokio::select! {
            _ = self.cancel.cancelled() => None,
            size = self.rx.recv() => size,
        };

        if size.is_none() {
            self.exhausted = true;
            self.rx.close();
        }

        size
    }

    /// Whether the sequence has ended
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
