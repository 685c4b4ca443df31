use std::sync::Arc;

use anketa_store::{SessionStore, SessionStoreError, StatusWriteOutcome};
use anketa_types::{SessionEvent, SessionStatus, StatusTransitionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),
    #[error(transparent)]
    Store(SessionStoreError),
}

impl From<SessionStoreError> for ControllerError {
    fn from(error: SessionStoreError) -> Self {
        match error {
            SessionStoreError::SessionNotFound(session_id) => Self::NotFound(session_id),
            other => Self::Store(other),
        }
    }
}

/// What a status write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// The session already had the requested status.
    Unchanged(SessionStatus),
    /// A background write lost to a fresher status; the persisted one stands.
    RaceLost {
        attempted: SessionStatus,
        persisted: SessionStatus,
    },
}

impl TransitionOutcome {
    /// Status persisted after the write attempt.
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Applied { to, .. } => to,
            Self::Unchanged(status) => status,
            Self::RaceLost { persisted, .. } => persisted,
        }
    }
}

/// Owns every status write for sessions held in `store`.
#[derive(Clone)]
pub struct SessionStateController {
    store: Arc<dyn SessionStore>,
}

impl SessionStateController {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Reads the persisted status; a missing session is `NotFound`.
    pub async fn authoritative_status(
        &self,
        session_id: &str,
    ) -> Result<SessionStatus, ControllerError> {
        self.store
            .get_session(session_id)
            .await?
            .map(|session| session.status)
            .ok_or_else(|| ControllerError::NotFound(session_id.to_string()))
    }

    pub async fn pause(&self, session_id: &str) -> Result<TransitionOutcome, ControllerError> {
        self.apply_event(session_id, SessionEvent::UserPaused).await
    }

    pub async fn resume(&self, session_id: &str) -> Result<TransitionOutcome, ControllerError> {
        self.apply_event(session_id, SessionEvent::UserResumed)
            .await
    }

    /// End-of-call cleanup: `active -> processing` unless a fresher status exists.
    pub async fn begin_processing(
        &self,
        session_id: &str,
    ) -> Result<TransitionOutcome, ControllerError> {
        self.apply_event(session_id, SessionEvent::CallEnded).await
    }

    /// Dialogue capture done: `active|processing -> reviewing` unless a fresher status exists.
    pub async fn begin_review(
        &self,
        session_id: &str,
    ) -> Result<TransitionOutcome, ControllerError> {
        self.apply_event(session_id, SessionEvent::CaptureCompleted)
            .await
    }

    pub async fn confirm(&self, session_id: &str) -> Result<TransitionOutcome, ControllerError> {
        self.apply_event(session_id, SessionEvent::UserConfirmed)
            .await
    }

    pub async fn decline(&self, session_id: &str) -> Result<TransitionOutcome, ControllerError> {
        self.apply_event(session_id, SessionEvent::UserDeclined)
            .await
    }

    /// Applies `event` with a conditional write against the freshly read status.
    ///
    /// Background events that lose the race return `RaceLost`; user events
    /// that are not applicable to the persisted status return an error.
    pub async fn apply_event(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<TransitionOutcome, ControllerError> {
        let target = event.target();

        if !event.is_background() {
            let current = self.authoritative_status(session_id).await?;
            current.apply(event)?;
        }

        let outcome = self
            .store
            .update_status_if(session_id, event.sources(), target)
            .await?;

        match outcome {
            StatusWriteOutcome::Applied { previous, current } if previous == current => {
                Ok(TransitionOutcome::Unchanged(current))
            }
            StatusWriteOutcome::Applied { previous, current } => {
                tracing::info!(
                    session_id,
                    event = ?event,
                    from = %previous,
                    to = %current,
                    "session status changed"
                );
                Ok(TransitionOutcome::Applied {
                    from: previous,
                    to: current,
                })
            }
            StatusWriteOutcome::Rejected { persisted } if event.is_background() => {
                tracing::debug!(
                    session_id,
                    event = ?event,
                    attempted = %target,
                    persisted = %persisted,
                    "background status write discarded for fresher status"
                );
                Ok(TransitionOutcome::RaceLost {
                    attempted: target,
                    persisted,
                })
            }
            StatusWriteOutcome::Rejected { persisted } => {
                Err(ControllerError::InvalidTransition(
                    StatusTransitionError::EventNotApplicable {
                        event,
                        from: persisted,
                    },
                ))
            }
        }
    }
}
