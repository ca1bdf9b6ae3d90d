//! Writing session output back to the SSH channel

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use crate::bridge::SessionOutput;

/// Extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Session output that can also end the session
#[async_trait]
pub trait SessionChannel: SessionOutput {
    /// Report the exit status and close the channel
    async fn exit(&mut self, code: u32);
}

/// Output sink bound to one russh channel
pub struct ChannelOutput {
    handle: Handle,
    channel: ChannelId,
}

impl ChannelOutput {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

fn channel_gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "SSH channel closed")
}

#[async_trait]
impl SessionOutput for ChannelOutput {
    async fn stdout(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| channel_gone())
    }

    async fn stderr(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.handle
            .extended_data(
                self.channel,
                SSH_EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(data),
            )
            .await
            .map_err(|_| channel_gone())
    }
}

#[async_trait]
impl SessionChannel for ChannelOutput {
    async fn exit(&mut self, code: u32) {
        // The client may already be gone; nothing to do about it then
        let _ = self.handle.exit_status_request(self.channel, code).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}
