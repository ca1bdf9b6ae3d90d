//! Terminal size messages

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::frame::{channel, ChannelFrame};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns
    #[serde(rename = "Width")]
    pub width: u16,
    /// Number of rows
    #[serde(rename = "Height")]
    pub height: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Build from the 32-bit cell counts an SSH client reports, saturating
    /// at `u16::MAX`
    pub fn from_cells(cols: u32, rows: u32) -> Self {
        Self {
            width: u16::try_from(cols).unwrap_or(u16::MAX),
            height: u16::try_from(rows).unwrap_or(u16::MAX),
        }
    }

    /// Resize frame for the remote pty
    pub fn to_frame(&self) -> Result<ChannelFrame, ProtocolError> {
        Ok(ChannelFrame::new(channel::RESIZE, serde_json::to_vec(self)?))
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}
