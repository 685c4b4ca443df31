use anketa_types::SessionStatus;
use serde::Serialize;

/// Which interview controls a client shows for a given status.
///
/// Always derived from an authoritative status read, never from a local guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusAffordances {
    pub input_enabled: bool,
    pub show_paused_indicator: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_end: bool,
    pub review_actions: bool,
    pub live_connection: bool,
}

impl StatusAffordances {
    pub fn for_status(status: SessionStatus) -> Self {
        let paused = status == SessionStatus::Paused;
        Self {
            input_enabled: status == SessionStatus::Active,
            show_paused_indicator: paused,
            can_pause: matches!(
                status,
                SessionStatus::Active | SessionStatus::Processing | SessionStatus::Reviewing
            ),
            can_resume: paused,
            can_end: status == SessionStatus::Active,
            review_actions: status == SessionStatus::Reviewing,
            live_connection: status.allows_live_connection(),
        }
    }
}
