//! Final status document sent on the error channel
//!
//! When the remote process exits, the API server writes a `Status` object
//! on channel 3. A clean exit reports `status: "Success"`; a non-zero exit
//! reports `status: "Failure"`, reason `NonZeroExitCode` and a cause with
//! reason `ExitCode` whose message is the decimal exit code.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Status value for a clean exit
pub const STATUS_SUCCESS: &str = "Success";

/// Cause reason carrying the exit code
pub const CAUSE_EXIT_CODE: &str = "ExitCode";

/// Exit code reported when the remote side failed without a code
pub const GENERIC_FAILURE_CODE: u32 = 1;

/// Subset of the API `Status` object relevant to exec sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCause {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RemoteStatus {
    /// Status of a clean exit
    pub fn success() -> Self {
        Self {
            status: Some(STATUS_SUCCESS.to_string()),
            ..Default::default()
        }
    }

    /// Parse the JSON document from the error channel
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Whether the remote process exited cleanly
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SUCCESS)
    }

    /// Exit code of the remote process
    pub fn exit_code(&self) -> u32 {
        if self.is_success() {
            return 0;
        }

        self.details
            .iter()
            .flat_map(|details| details.causes.iter())
            .filter(|cause| cause.reason.as_deref() == Some(CAUSE_EXIT_CODE))
            .find_map(|cause| cause.message.as_deref()?.trim().parse::<u32>().ok())
            .unwrap_or(GENERIC_FAILURE_CODE)
    }
}
