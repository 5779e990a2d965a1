//! Session events pushed to the manager's owner (e.g. an HTTP broadcaster).

use ttyhub_core::StatusUpdate;

/// Lifecycle and I/O events for all sessions, delivered in per-session
/// order over a broadcast channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created {
        id: String,
    },
    /// Raw output bytes, in exactly the order read from the process
    /// (plus injected title sequences).
    Output {
        id: String,
        data: Vec<u8>,
    },
    Resized {
        id: String,
        cols: u16,
        rows: u16,
    },
    Renamed {
        id: String,
        name: String,
    },
    /// Forwarded status update from an attached IPC reporter.
    Status {
        id: String,
        update: StatusUpdate,
    },
    Exited {
        id: String,
        exit_code: i32,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Created { id }
            | SessionEvent::Output { id, .. }
            | SessionEvent::Resized { id, .. }
            | SessionEvent::Renamed { id, .. }
            | SessionEvent::Status { id, .. }
            | SessionEvent::Exited { id, .. } => id,
        }
    }
}
