use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{AiBlock, SessionStatus};

/// Questionnaire data as persisted and exchanged on the wire.
pub type AnketaRecord = serde_json::Map<String, Value>;

/// Error returned when a voice setting update touches a locked key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceConfigError {
    #[error("voice setting '{0}' is locked for the lifetime of the session")]
    Locked(String),
}

/// Voice settings split into values pinned at session start and editable ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub locked: BTreeMap<String, Value>,
    #[serde(default)]
    pub editable: BTreeMap<String, Value>,
}

impl VoiceConfig {
    /// Merges `update` into the editable settings.
    ///
    /// Rejects the whole update when any key is locked; nothing is applied then.
    pub fn apply_editable_update(
        &mut self,
        update: &BTreeMap<String, Value>,
    ) -> Result<(), VoiceConfigError> {
        if let Some(key) = update.keys().find(|key| self.locked.contains_key(*key)) {
            return Err(VoiceConfigError::Locked(key.clone()));
        }
        for (key, value) in update {
            self.editable.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Effective settings; locked values always win over editable ones.
    pub fn effective(&self) -> BTreeMap<String, Value> {
        let mut merged = self.editable.clone();
        for (key, value) in &self.locked {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    User,
    Assistant,
    System,
}

impl DialogueRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One append-only dialogue line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueEntry {
    #[serde(default)]
    pub sequence_id: u64,
    pub role: DialogueRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl DialogueEntry {
    pub fn new(role: DialogueRole, content: impl Into<String>) -> Self {
        Self {
            sequence_id: 0,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Input for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    #[serde(default)]
    pub voice_config: VoiceConfig,
    #[serde(default)]
    pub anketa: AnketaRecord,
}

/// A persisted consultation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub access_link: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub anketa: AnketaRecord,
    #[serde(default)]
    pub voice_config: VoiceConfig,
    #[serde(default)]
    pub room_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        access_link: impl Into<String>,
        input: NewSession,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            access_link: access_link.into(),
            status: SessionStatus::Active,
            anketa: input.anketa,
            voice_config: input.voice_config,
            room_reference: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A freshly minted credential for joining the session's media room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCredential {
    pub session_id: String,
    pub room: String,
    /// Stable per-session participant identity; rejoining replaces membership.
    pub identity: String,
    pub server_url: String,
    pub token: String,
    pub expires_unix: u64,
}

/// Response body of a status-changing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub session_id: String,
    pub status: SessionStatus,
    /// False when the session already had the requested status.
    #[serde(default)]
    pub changed: bool,
}

/// Resume response: the new status plus a credential for rejoining the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeGrant {
    pub session_id: String,
    pub status: SessionStatus,
    pub credential: JoinCredential,
}

/// Status and questionnaire snapshot returned by the poll endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    /// Storage-shaped questionnaire data; clients normalize before use.
    #[serde(default)]
    pub anketa: AnketaRecord,
    pub completion_percent: u8,
    /// True while a finalize routine runs for this session.
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub ai_blocks: Vec<AiBlock>,
    #[serde(default)]
    pub dialogue_turns: usize,
    pub updated_at: DateTime<Utc>,
}
