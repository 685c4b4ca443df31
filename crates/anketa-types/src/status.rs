use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid session status transition: {from} -> {to}")]
    Invalid {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("event {event:?} does not apply to session status {from}")]
    EventNotApplicable {
        event: SessionEvent,
        from: SessionStatus,
    },
    #[error("unknown session status '{0}'")]
    UnknownStatus(String),
}

/// Lifecycle state for a consultation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    /// The agent is finalizing synchronously after a disconnect.
    Processing,
    /// AI post-processing of the dialogue into the final document.
    Reviewing,
    Confirmed,
    Declined,
}

/// Named events that drive session status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    UserPaused,
    UserResumed,
    /// Disconnect or end-of-call cleanup without a preceding pause.
    CallEnded,
    /// Dialogue capture completed and AI synthesis started.
    CaptureCompleted,
    UserConfirmed,
    UserDeclined,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 6] = [
        Self::Active,
        Self::Paused,
        Self::Processing,
        Self::Reviewing,
        Self::Confirmed,
        Self::Declined,
    ];

    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (Self::Active, Self::Processing)
                | (Self::Active, Self::Reviewing)
                | (Self::Processing, Self::Reviewing)
                | (Self::Processing, Self::Paused)
                | (Self::Reviewing, Self::Paused)
                | (Self::Reviewing, Self::Confirmed)
                | (Self::Reviewing, Self::Declined)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StatusTransitionError::Invalid {
            from: self,
            to: next,
        })
    }

    /// Returns true when no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Declined)
    }

    /// Statuses for which entering the session view rejoins the media room.
    pub fn allows_live_connection(self) -> bool {
        matches!(self, Self::Active | Self::Paused | Self::Processing)
    }

    /// Statuses a background write to `next` may overwrite.
    ///
    /// Only `processing` and `reviewing` are written by background routines;
    /// everything else is user-initiated and returns the full predecessor set.
    pub fn background_predecessors(next: Self) -> &'static [SessionStatus] {
        match next {
            Self::Processing => &[Self::Active],
            Self::Reviewing => &[Self::Active, Self::Processing],
            Self::Active => &[Self::Paused],
            Self::Paused => &[Self::Active, Self::Processing, Self::Reviewing],
            Self::Confirmed | Self::Declined => &[Self::Reviewing],
        }
    }

    /// Applies `event` and returns the resulting status.
    pub fn apply(self, event: SessionEvent) -> Result<Self, StatusTransitionError> {
        let next = event.target();
        if self == next || event.sources().contains(&self) {
            return Ok(next);
        }
        Err(StatusTransitionError::EventNotApplicable { event, from: self })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Processing => "processing",
            Self::Reviewing => "reviewing",
            Self::Confirmed => "confirmed",
            Self::Declined => "declined",
        }
    }
}

impl SessionEvent {
    /// Status the event moves a session into.
    pub fn target(self) -> SessionStatus {
        match self {
            Self::UserPaused => SessionStatus::Paused,
            Self::UserResumed => SessionStatus::Active,
            Self::CallEnded => SessionStatus::Processing,
            Self::CaptureCompleted => SessionStatus::Reviewing,
            Self::UserConfirmed => SessionStatus::Confirmed,
            Self::UserDeclined => SessionStatus::Declined,
        }
    }

    /// Statuses from which the event is accepted.
    pub fn sources(self) -> &'static [SessionStatus] {
        SessionStatus::background_predecessors(self.target())
    }

    /// Background events must lose to any concurrent user action.
    pub fn is_background(self) -> bool {
        matches!(self, Self::CallEnded | Self::CaptureCompleted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StatusTransitionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == raw.trim())
            .ok_or_else(|| StatusTransitionError::UnknownStatus(raw.to_string()))
    }
}
