//! Error taxonomy shared by every layer of a live session.

use thiserror::Error;

/// Failures the session layer reports to its caller.
///
/// Only `Device` and `Authorization` are terminal for the attempt in progress;
/// `Transient` is recovered internally by the retry policy and only ever
/// surfaces as advisory status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Audio device unavailable: {0}")]
    Device(String),

    #[error("Authorization rejected by the voice endpoint: {0}")]
    Authorization(String),

    #[error("Connection lost: {0}")]
    Transient(String),

    #[error("No live session is streaming")]
    NotConnected,

    #[error("Session controller has shut down")]
    ControllerClosed,
}

impl SessionError {
    /// Whether the retry policy is allowed to act on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transient(_))
    }
}

/// A failure inside a tool handler. Never leaves the dispatcher.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
