use thiserror::Error;

/// Failure classes a session view reacts to differently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The session no longer exists; background activity must stop.
    #[error("session '{0}' not found")]
    NotFound(String),
    /// Network or server hiccup; retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The join credential could not be issued; the user may retry.
    #[error("join credential unavailable: {0}")]
    Credential(String),
    #[error("microphone permission denied: {0}")]
    MediaPermission(String),
    #[error("media connection failed: {0}")]
    Media(String),
    /// The request was aborted locally and must not count as a failure.
    #[error("request cancelled")]
    Cancelled,
    #[error("server rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the failure counts toward the poller's failure streak.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::NotFound(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
