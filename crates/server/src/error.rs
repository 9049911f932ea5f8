//! Error types for the session core

use companion_connector::ConnectorError;
use thiserror::Error;

/// Logic errors: the request was understood but cannot apply to the session
/// as it stands. Reported to the caller, never fatal.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Session closed: {0}")]
    Closed(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Unknown permission request: {0}")]
    UnknownPermission(String),

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("Nothing to retry: {0}")]
    RetryUnavailable(&'static str),
}

impl SessionError {
    /// Stable code for `ServerMessage::Error`.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "not_found",
            SessionError::AlreadyExists(_) => "already_exists",
            SessionError::Closed(_) => "session_closed",
            SessionError::NotConnected => "not_connected",
            SessionError::UnknownPermission(_) => "unknown_permission",
            SessionError::EmptyMessage => "empty_message",
            SessionError::RetryUnavailable(_) => "retry_unavailable",
        }
    }
}

/// Outcomes of a connect attempt that did not end connected
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ConnectorError,
    },

    #[error("Connect failed: {0}")]
    Fatal(#[source] ConnectorError),

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::Cancelled => "connect_cancelled",
            SupervisorError::Exhausted { .. } | SupervisorError::Fatal(_) => "transport_failed",
            SupervisorError::ShuttingDown => "shutting_down",
        }
    }
}
