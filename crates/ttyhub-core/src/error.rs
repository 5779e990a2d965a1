use thiserror::Error;

/// Why a session process failed to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The command was not found on PATH (or the given path does not exist).
    NotFound,
    /// The resolved file exists but is not executable.
    NotExecutable,
    /// The pseudo-terminal could not be allocated.
    PtyAllocation,
    /// The requested working directory does not exist or is not a directory.
    BadWorkingDir,
}

impl SpawnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnFailure::NotFound => "not-found",
            SpawnFailure::NotExecutable => "not-executable",
            SpawnFailure::PtyAllocation => "terminal-allocation-failed",
            SpawnFailure::BadWorkingDir => "bad-cwd",
        }
    }
}

/// Errors produced by the ttyhub session layer.
///
/// Every variant maps to a stable machine-readable code via [`HubError::code`];
/// variants that concern a specific session expose it via [`HubError::session_id`].
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to spawn `{command}`: {cause}", cause = .cause.as_str())]
    SpawnFailed {
        command: String,
        cause: SpawnFailure,
        detail: String,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("session directory deleted for {0}")]
    SessionDirDeleted(String),

    #[error("failed to save session {session_id}: {detail}")]
    SaveSessionFailed { session_id: String, detail: String },

    #[error("failed to send input to session {session_id}: {detail}")]
    SendInputFailed { session_id: String, detail: String },

    #[error("failed to resize session {session_id}: {detail}")]
    ResizeFailed { session_id: String, detail: String },

    #[error("failed to kill session {session_id}: {detail}")]
    KillFailed { session_id: String, detail: String },

    #[error("failed to reset size of session {session_id}: {detail}")]
    ResetSizeFailed { session_id: String, detail: String },

    #[error("no socket connection for session {0}")]
    NoSocketConnection(String),

    #[error("unknown special key: {0}")]
    UnknownKey(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Stable machine-readable error code exposed to collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::SpawnFailed { .. } => "SPAWN_FAILED",
            HubError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            HubError::InvalidSessionId(_) => "INVALID_SESSION_ID",
            HubError::SessionDirDeleted(_) => "SESSION_DIR_DELETED",
            HubError::SaveSessionFailed { .. } => "SAVE_SESSION_FAILED",
            HubError::SendInputFailed { .. } => "SEND_INPUT_FAILED",
            HubError::ResizeFailed { .. } => "RESIZE_FAILED",
            HubError::KillFailed { .. } => "KILL_FAILED",
            HubError::ResetSizeFailed { .. } => "RESET_SIZE_FAILED",
            HubError::NoSocketConnection(_) => "NO_SOCKET_CONNECTION",
            HubError::UnknownKey(_) => "UNKNOWN_KEY",
            HubError::Protocol(_) => "PROTOCOL_ERROR",
            HubError::Io(_) => "IO_ERROR",
            HubError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// The session this error concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            HubError::SessionNotFound(id)
            | HubError::SessionDirDeleted(id)
            | HubError::NoSocketConnection(id) => Some(id),
            HubError::SaveSessionFailed { session_id, .. }
            | HubError::SendInputFailed { session_id, .. }
            | HubError::ResizeFailed { session_id, .. }
            | HubError::KillFailed { session_id, .. }
            | HubError::ResetSizeFailed { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;
