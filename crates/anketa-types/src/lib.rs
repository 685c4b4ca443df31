//! Shared data types for anketa consultation sessions.
//!
//! Holds the session lifecycle graph, the canonical questionnaire schema, the
//! tagged AI-derived block shapes and the wire records exchanged between the
//! gateway, the store and the client runtime.

mod blocks;
mod schema;
mod session;
mod status;

pub use blocks::{AiBlock, KnownAiBlock};
pub use schema::{
    canonical_field, completion_percentage, interview_completion_percentage, is_canonical_field,
    FieldKind, FieldSpec, FieldValue, QuestionPair, CANONICAL_FIELDS,
};
pub use session::{
    AnketaRecord, DialogueEntry, DialogueRole, JoinCredential, NewSession, PollSnapshot,
    ResumeGrant, SessionRecord, StatusChange, VoiceConfig, VoiceConfigError,
};
pub use status::{SessionEvent, SessionStatus, StatusTransitionError};
