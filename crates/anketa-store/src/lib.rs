//! Session store abstractions and in-memory backend.

use std::collections::{BTreeMap, HashMap};

use anketa_types::{
    AiBlock, AnketaRecord, DialogueEntry, SessionRecord, SessionStatus, VoiceConfig,
    VoiceConfigError,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteSessionStore;

/// Result type for session store operations.
pub type StoreResult<T> = Result<T, SessionStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),
    #[error("access link is already bound to another session")]
    AccessLinkConflict,
    #[error(transparent)]
    VoiceConfig(#[from] VoiceConfigError),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("store task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a conditional status write.
///
/// `Rejected` is not an error: the persisted status was fresher than the
/// writer's view and has been preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWriteOutcome {
    Applied {
        previous: SessionStatus,
        current: SessionStatus,
    },
    Rejected {
        persisted: SessionStatus,
    },
}

impl StatusWriteOutcome {
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Applied { current, .. } => current,
            Self::Rejected { persisted } => persisted,
        }
    }

    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Decides a conditional status write against the freshly read `persisted`.
pub(crate) fn decide_status_write(
    persisted: SessionStatus,
    expected: &[SessionStatus],
    next: SessionStatus,
) -> StatusWriteOutcome {
    if persisted == next || expected.contains(&persisted) {
        StatusWriteOutcome::Applied {
            previous: persisted,
            current: next,
        }
    } else {
        StatusWriteOutcome::Rejected { persisted }
    }
}

/// Async store contract shared by the HTTP handlers and the voice agent side.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, record: SessionRecord) -> StoreResult<SessionRecord>;
    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;
    async fn get_session_by_access_link(
        &self,
        access_link: &str,
    ) -> StoreResult<Option<SessionRecord>>;

    /// Re-reads the persisted status and writes `next` only when it is one of
    /// `expected` (or already `next`). Read and write share one critical section.
    async fn update_status_if(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> StoreResult<StatusWriteOutcome>;

    /// Merges `update` into the stored questionnaire, last write wins per key.
    /// Returns the stored questionnaire after the merge.
    async fn merge_anketa(&self, session_id: &str, update: AnketaRecord)
        -> StoreResult<AnketaRecord>;

    async fn update_voice_config(
        &self,
        session_id: &str,
        editable: &BTreeMap<String, Value>,
    ) -> StoreResult<VoiceConfig>;

    /// Returns the session's room, assigning `proposed` only when none exists.
    async fn ensure_room_reference(&self, session_id: &str, proposed: &str)
        -> StoreResult<String>;

    /// Appends a dialogue entry and returns it with its sequence id.
    async fn append_dialogue(
        &self,
        session_id: &str,
        entry: DialogueEntry,
    ) -> StoreResult<DialogueEntry>;
    async fn list_dialogue(&self, session_id: &str) -> StoreResult<Vec<DialogueEntry>>;
    async fn count_dialogue(&self, session_id: &str) -> StoreResult<usize> {
        Ok(self.list_dialogue(session_id).await?.len())
    }

    async fn append_ai_blocks(&self, session_id: &str, blocks: Vec<AiBlock>) -> StoreResult<()>;
    async fn list_ai_blocks(&self, session_id: &str) -> StoreResult<Vec<AiBlock>>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, SessionRecord>,
    session_ids_by_link: HashMap<String, String>,
    dialogue: HashMap<String, Vec<DialogueEntry>>,
    ai_blocks: HashMap<String, Vec<AiBlock>>,
}

impl StoreInner {
    fn session_mut(&mut self, session_id: &str) -> StoreResult<&mut SessionRecord> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionStoreError::SessionNotFound(session_id.to_string()))
    }

    fn ensure_exists(&self, session_id: &str) -> StoreResult<()> {
        if self.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(SessionStoreError::SessionNotFound(session_id.to_string()))
        }
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, record: SessionRecord) -> StoreResult<SessionRecord> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&record.session_id) {
            return Err(SessionStoreError::SessionAlreadyExists(
                record.session_id.clone(),
            ));
        }
        if inner.session_ids_by_link.contains_key(&record.access_link) {
            return Err(SessionStoreError::AccessLinkConflict);
        }
        inner
            .session_ids_by_link
            .insert(record.access_link.clone(), record.session_id.clone());
        inner
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn get_session_by_access_link(
        &self,
        access_link: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .session_ids_by_link
            .get(access_link)
            .and_then(|session_id| inner.sessions.get(session_id))
            .cloned())
    }

    async fn update_status_if(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> StoreResult<StatusWriteOutcome> {
        let mut inner = self.inner.write().await;
        let session = inner.session_mut(session_id)?;
        let outcome = decide_status_write(session.status, expected, next);
        if outcome.is_applied() && session.status != next {
            session.status = next;
            session.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    async fn merge_anketa(
        &self,
        session_id: &str,
        update: AnketaRecord,
    ) -> StoreResult<AnketaRecord> {
        let mut inner = self.inner.write().await;
        let session = inner.session_mut(session_id)?;
        for (key, value) in update {
            session.anketa.insert(key, value);
        }
        session.updated_at = Utc::now();
        Ok(session.anketa.clone())
    }

    async fn update_voice_config(
        &self,
        session_id: &str,
        editable: &BTreeMap<String, Value>,
    ) -> StoreResult<VoiceConfig> {
        let mut inner = self.inner.write().await;
        let session = inner.session_mut(session_id)?;
        session.voice_config.apply_editable_update(editable)?;
        session.updated_at = Utc::now();
        Ok(session.voice_config.clone())
    }

    async fn ensure_room_reference(
        &self,
        session_id: &str,
        proposed: &str,
    ) -> StoreResult<String> {
        let mut inner = self.inner.write().await;
        let session = inner.session_mut(session_id)?;
        if let Some(room) = session.room_reference.as_ref() {
            return Ok(room.clone());
        }
        session.room_reference = Some(proposed.to_string());
        session.updated_at = Utc::now();
        Ok(proposed.to_string())
    }

    async fn append_dialogue(
        &self,
        session_id: &str,
        mut entry: DialogueEntry,
    ) -> StoreResult<DialogueEntry> {
        let mut inner = self.inner.write().await;
        inner.ensure_exists(session_id)?;
        let entries = inner.dialogue.entry(session_id.to_string()).or_default();
        entry.sequence_id = entries.len() as u64 + 1;
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn list_dialogue(&self, session_id: &str) -> StoreResult<Vec<DialogueEntry>> {
        let inner = self.inner.read().await;
        inner.ensure_exists(session_id)?;
        Ok(inner.dialogue.get(session_id).cloned().unwrap_or_default())
    }

    async fn count_dialogue(&self, session_id: &str) -> StoreResult<usize> {
        let inner = self.inner.read().await;
        inner.ensure_exists(session_id)?;
        Ok(inner.dialogue.get(session_id).map(Vec::len).unwrap_or(0))
    }

    async fn append_ai_blocks(&self, session_id: &str, blocks: Vec<AiBlock>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.ensure_exists(session_id)?;
        inner
            .ai_blocks
            .entry(session_id.to_string())
            .or_default()
            .extend(blocks);
        Ok(())
    }

    async fn list_ai_blocks(&self, session_id: &str) -> StoreResult<Vec<AiBlock>> {
        let inner = self.inner.read().await;
        inner.ensure_exists(session_id)?;
        Ok(inner.ai_blocks.get(session_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use anketa_types::{
        AiBlock, DialogueEntry, DialogueRole, NewSession, SessionRecord, SessionStatus,
        VoiceConfig,
    };
    use serde_json::json;

    use super::{InMemorySessionStore, SessionStore, SessionStoreError, StatusWriteOutcome};

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(
            id,
            format!("link-{id}"),
            NewSession {
                voice_config: VoiceConfig {
                    locked: BTreeMap::from([("voice".to_string(), json!("alloy"))]),
                    editable: BTreeMap::new(),
                },
                ..NewSession::default()
            },
        )
    }

    #[tokio::test]
    async fn creates_and_reads_sessions_by_id_and_link() {
        let store = InMemorySessionStore::new();
        store.create_session(record("s-1")).await.expect("create");

        let by_id = store.get_session("s-1").await.expect("read").expect("row");
        let by_link = store
            .get_session_by_access_link("link-s-1")
            .await
            .expect("read")
            .expect("row");
        assert_eq!(by_id, by_link);
        assert_eq!(by_id.status, SessionStatus::Active);
        assert!(store.get_session("missing").await.expect("read").is_none());

        let duplicate = store.create_session(record("s-1")).await;
        assert!(matches!(
            duplicate,
            Err(SessionStoreError::SessionAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn conditional_status_write_preserves_fresher_status() {
        let store = InMemorySessionStore::new();
        store.create_session(record("s-1")).await.expect("create");

        let paused = store
            .update_status_if("s-1", &[SessionStatus::Active], SessionStatus::Paused)
            .await
            .expect("pause");
        assert_eq!(
            paused,
            StatusWriteOutcome::Applied {
                previous: SessionStatus::Active,
                current: SessionStatus::Paused,
            }
        );

        let finalize = store
            .update_status_if("s-1", &[SessionStatus::Active], SessionStatus::Processing)
            .await
            .expect("finalize");
        assert_eq!(
            finalize,
            StatusWriteOutcome::Rejected {
                persisted: SessionStatus::Paused
            }
        );
        let stored = store.get_session("s-1").await.expect("read").expect("row");
        assert_eq!(stored.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn concurrent_pause_and_finalize_never_persist_processing_after_pause() {
        for _ in 0..32 {
            let store = Arc::new(InMemorySessionStore::new());
            store.create_session(record("s-1")).await.expect("create");

            let pause = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .update_status_if(
                            "s-1",
                            &[SessionStatus::Active, SessionStatus::Processing],
                            SessionStatus::Paused,
                        )
                        .await
                })
            };
            let finalize = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .update_status_if("s-1", &[SessionStatus::Active], SessionStatus::Processing)
                        .await
                })
            };
            let pause = pause.await.expect("join").expect("pause");
            finalize.await.expect("join").expect("finalize");

            assert!(pause.is_applied());
            let stored = store.get_session("s-1").await.expect("read").expect("row");
            assert_eq!(stored.status, SessionStatus::Paused);
        }
    }

    #[tokio::test]
    async fn merges_anketa_last_write_wins_per_key() {
        let store = InMemorySessionStore::new();
        store.create_session(record("s-1")).await.expect("create");

        let update = json!({"company_name": "Acme", "city": "Kazan"});
        store
            .merge_anketa("s-1", update.as_object().cloned().expect("object"))
            .await
            .expect("merge");
        let update = json!({"city": "Samara"});
        let merged = store
            .merge_anketa("s-1", update.as_object().cloned().expect("object"))
            .await
            .expect("merge");
        assert_eq!(merged["company_name"], json!("Acme"));
        assert_eq!(merged["city"], json!("Samara"));
    }

    #[tokio::test]
    async fn voice_config_updates_never_touch_locked_settings() {
        let store = InMemorySessionStore::new();
        store.create_session(record("s-1")).await.expect("create");

        let rejected = store
            .update_voice_config(
                "s-1",
                &BTreeMap::from([("voice".to_string(), json!("echo"))]),
            )
            .await;
        assert!(matches!(rejected, Err(SessionStoreError::VoiceConfig(_))));

        let config = store
            .update_voice_config(
                "s-1",
                &BTreeMap::from([("speed".to_string(), json!(1.25))]),
            )
            .await
            .expect("editable update");
        assert_eq!(config.locked["voice"], json!("alloy"));
        assert_eq!(config.editable["speed"], json!(1.25));
    }

    #[tokio::test]
    async fn room_reference_is_assigned_once() {
        let store = InMemorySessionStore::new();
        store.create_session(record("s-1")).await.expect("create");

        let first = store
            .ensure_room_reference("s-1", "room-a")
            .await
            .expect("room");
        let second = store
            .ensure_room_reference("s-1", "room-b")
            .await
            .expect("room");
        assert_eq!(first, "room-a");
        assert_eq!(second, "room-a");
    }

    #[tokio::test]
    async fn dialogue_and_blocks_are_append_only() {
        let store = InMemorySessionStore::new();
        store.create_session(record("s-1")).await.expect("create");

        let first = store
            .append_dialogue("s-1", DialogueEntry::new(DialogueRole::Assistant, "Hello"))
            .await
            .expect("append");
        let second = store
            .append_dialogue("s-1", DialogueEntry::new(DialogueRole::User, "Hi"))
            .await
            .expect("append");
        assert_eq!((first.sequence_id, second.sequence_id), (1, 2));
        assert_eq!(store.count_dialogue("s-1").await.expect("count"), 2);

        store
            .append_ai_blocks(
                "s-1",
                vec![AiBlock::from_value(json!({"kind": "summary", "text": "ok"}))],
            )
            .await
            .expect("blocks");
        assert_eq!(store.list_ai_blocks("s-1").await.expect("list").len(), 1);

        let missing = store
            .append_dialogue("nope", DialogueEntry::new(DialogueRole::User, "x"))
            .await;
        assert!(matches!(missing, Err(SessionStoreError::SessionNotFound(_))));
    }
}
