//! JSON payload types carried inside control, status, and error frames.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control command carried in a [`FrameType::Control`](crate::FrameType::Control)
/// frame. Tagged on the `cmd` field; the same commands back the direct
/// session-manager API, so an out-of-process forwarder and an in-process
/// caller take identical code paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCommand {
    /// Resize the session's terminal.
    Resize { cols: u16, rows: u16 },
    /// Terminate the session; `signal` defaults to graceful (SIGTERM).
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// Restore the terminal to the session's initial geometry.
    ResetSize,
    /// Rename the session (title recomputed for static/dynamic modes).
    UpdateTitle { title: String },
}

/// Status update published by an external reporter inside a session
/// (e.g. a CLI announcing what an interactive tool is doing). Cached per
/// session and rebroadcast to every other connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub app: String,
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Error payload carried in an error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn from_error(err: &HubError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: err
                .session_id()
                .map(|id| serde_json::json!({ "sessionId": id })),
        }
    }
}

impl ControlCommand {
    pub fn to_json(&self) -> HubResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| HubError::Protocol(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> HubResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| HubError::Protocol(format!("bad control payload: {e}")))
    }
}
