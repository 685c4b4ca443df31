//! SQLite-backed `SessionStore` implementation with durable persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anketa_types::{
    AiBlock, AnketaRecord, DialogueEntry, DialogueRole, SessionRecord, SessionStatus, VoiceConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{decide_status_write, SessionStore, SessionStoreError, StatusWriteOutcome, StoreResult};

const SESSION_COLUMNS: &str = "session_id, access_link, status, anketa_json, voice_config_json, \
                               room_reference, created_at, updated_at";

/// Persistent SQLite store backend for consultation sessions.
#[derive(Debug)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        tracing::debug!(path = %store.db_path.display(), "session store schema ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                access_link TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                anketa_json TEXT NOT NULL,
                voice_config_json TEXT NOT NULL,
                room_reference TEXT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dialogue (
                entry_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                sequence_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id) ON DELETE CASCADE,
                UNIQUE(session_id, sequence_id)
            );

            CREATE TABLE IF NOT EXISTS ai_blocks (
                block_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                block_json TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_dialogue_session ON dialogue (session_id, sequence_id);
            CREATE INDEX IF NOT EXISTS idx_ai_blocks_session ON ai_blocks (session_id, block_row_id);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, record: SessionRecord) -> StoreResult<SessionRecord> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing_id = transaction
            .query_row(
                "SELECT 1 FROM sessions WHERE session_id = ?1",
                params![record.session_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if existing_id.is_some() {
            return Err(SessionStoreError::SessionAlreadyExists(record.session_id));
        }
        let existing_link = transaction
            .query_row(
                "SELECT 1 FROM sessions WHERE access_link = ?1",
                params![record.access_link],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if existing_link.is_some() {
            return Err(SessionStoreError::AccessLinkConflict);
        }

        transaction.execute(
            r#"
            INSERT INTO sessions (
                session_id, access_link, status, anketa_json, voice_config_json,
                room_reference, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.session_id,
                record.access_link,
                record.status.as_str(),
                serialize_json(&record.anketa)?,
                serialize_json(&record.voice_config)?,
                record.room_reference,
                timestamp_to_db(record.created_at),
                timestamp_to_db(record.updated_at),
            ],
        )?;
        transaction.commit()?;
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let connection = self.open_connection()?;
        load_session(&connection, "session_id", session_id)
    }

    async fn get_session_by_access_link(
        &self,
        access_link: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        let connection = self.open_connection()?;
        load_session(&connection, "access_link", access_link)
    }

    async fn update_status_if(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> StoreResult<StatusWriteOutcome> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let persisted: Option<String> = transaction
            .query_row(
                "SELECT status FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(persisted) = persisted else {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        };
        let persisted = session_status_from_db(&persisted)?;

        let outcome = decide_status_write(persisted, expected, next);
        if outcome.is_applied() && persisted != next {
            transaction.execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, next.as_str(), timestamp_to_db(Utc::now())],
            )?;
        }
        transaction.commit()?;
        Ok(outcome)
    }

    async fn merge_anketa(
        &self,
        session_id: &str,
        update: AnketaRecord,
    ) -> StoreResult<AnketaRecord> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw: Option<String> = transaction
            .query_row(
                "SELECT anketa_json FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        };
        let mut anketa: AnketaRecord = deserialize_json(&raw)?;
        for (key, value) in update {
            anketa.insert(key, value);
        }

        transaction.execute(
            "UPDATE sessions SET anketa_json = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![
                session_id,
                serialize_json(&anketa)?,
                timestamp_to_db(Utc::now())
            ],
        )?;
        transaction.commit()?;
        Ok(anketa)
    }

    async fn update_voice_config(
        &self,
        session_id: &str,
        editable: &BTreeMap<String, Value>,
    ) -> StoreResult<VoiceConfig> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw: Option<String> = transaction
            .query_row(
                "SELECT voice_config_json FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        };
        let mut config: VoiceConfig = deserialize_json(&raw)?;
        config.apply_editable_update(editable)?;

        transaction.execute(
            "UPDATE sessions SET voice_config_json = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![
                session_id,
                serialize_json(&config)?,
                timestamp_to_db(Utc::now())
            ],
        )?;
        transaction.commit()?;
        Ok(config)
    }

    async fn ensure_room_reference(
        &self,
        session_id: &str,
        proposed: &str,
    ) -> StoreResult<String> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<Option<String>> = transaction
            .query_row(
                "SELECT room_reference FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
        };
        if let Some(room) = current {
            transaction.commit()?;
            return Ok(room);
        }

        transaction.execute(
            "UPDATE sessions SET room_reference = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, proposed, timestamp_to_db(Utc::now())],
        )?;
        transaction.commit()?;
        Ok(proposed.to_string())
    }

    async fn append_dialogue(
        &self,
        session_id: &str,
        mut entry: DialogueEntry,
    ) -> StoreResult<DialogueEntry> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_session_exists(&transaction, session_id)?;

        let last: i64 = transaction.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM dialogue WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        entry.sequence_id = u64::try_from(last).unwrap_or(0) + 1;

        transaction.execute(
            r#"
            INSERT INTO dialogue (session_id, sequence_id, role, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                session_id,
                i64::try_from(entry.sequence_id).unwrap_or(i64::MAX),
                entry.role.as_str(),
                entry.content,
                timestamp_to_db(entry.created_at),
            ],
        )?;
        transaction.commit()?;
        Ok(entry)
    }

    async fn list_dialogue(&self, session_id: &str) -> StoreResult<Vec<DialogueEntry>> {
        let connection = self.open_connection()?;
        ensure_session_exists(&connection, session_id)?;

        let mut statement = connection.prepare(
            r#"
            SELECT sequence_id, role, content, created_at
            FROM dialogue WHERE session_id = ?1 ORDER BY sequence_id
            "#,
        )?;
        let rows = statement.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence_id, role, content, created_at) = row?;
            let role =
                DialogueRole::parse(&role).ok_or(SessionStoreError::InvalidPersistedValue {
                    field: "dialogue_role",
                    value: role.clone(),
                })?;
            entries.push(DialogueEntry {
                sequence_id: u64::try_from(sequence_id).unwrap_or(0),
                role,
                content,
                created_at: timestamp_from_db(&created_at)?,
            });
        }
        Ok(entries)
    }

    async fn count_dialogue(&self, session_id: &str) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        ensure_session_exists(&connection, session_id)?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM dialogue WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn append_ai_blocks(&self, session_id: &str, blocks: Vec<AiBlock>) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        ensure_session_exists(&transaction, session_id)?;
        for block in &blocks {
            transaction.execute(
                "INSERT INTO ai_blocks (session_id, block_json) VALUES (?1, ?2)",
                params![session_id, serialize_json(block)?],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    async fn list_ai_blocks(&self, session_id: &str) -> StoreResult<Vec<AiBlock>> {
        let connection = self.open_connection()?;
        ensure_session_exists(&connection, session_id)?;

        let mut statement = connection.prepare(
            "SELECT block_json FROM ai_blocks WHERE session_id = ?1 ORDER BY block_row_id",
        )?;
        let rows = statement.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut blocks = Vec::new();
        for raw in rows {
            let value: Value = deserialize_json(&raw?)?;
            blocks.push(AiBlock::from_value(value));
        }
        Ok(blocks)
    }
}

fn ensure_session_exists(connection: &Connection, session_id: &str) -> StoreResult<()> {
    let exists = connection
        .query_row(
            "SELECT 1 FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(SessionStoreError::SessionNotFound(session_id.to_string()));
    }
    Ok(())
}

fn load_session(
    connection: &Connection,
    key_column: &'static str,
    key: &str,
) -> StoreResult<Option<SessionRecord>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE {key_column} = ?1");
    let raw = connection
        .query_row(&sql, params![key], raw_session_row)
        .optional()?;
    raw.map(RawSessionRow::into_record).transpose()
}

struct RawSessionRow {
    session_id: String,
    access_link: String,
    status: String,
    anketa_json: String,
    voice_config_json: String,
    room_reference: Option<String>,
    created_at: String,
    updated_at: String,
}

fn raw_session_row(row: &Row<'_>) -> rusqlite::Result<RawSessionRow> {
    Ok(RawSessionRow {
        session_id: row.get(0)?,
        access_link: row.get(1)?,
        status: row.get(2)?,
        anketa_json: row.get(3)?,
        voice_config_json: row.get(4)?,
        room_reference: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawSessionRow {
    fn into_record(self) -> StoreResult<SessionRecord> {
        Ok(SessionRecord {
            session_id: self.session_id,
            access_link: self.access_link,
            status: session_status_from_db(&self.status)?,
            anketa: deserialize_json(&self.anketa_json)?,
            voice_config: deserialize_json(&self.voice_config_json)?,
            room_reference: self.room_reference,
            created_at: timestamp_from_db(&self.created_at)?,
            updated_at: timestamp_from_db(&self.updated_at)?,
        })
    }
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(SessionStoreError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(SessionStoreError::from)
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn session_status_from_db(value: &str) -> StoreResult<SessionStatus> {
    value
        .parse::<SessionStatus>()
        .map_err(|_| SessionStoreError::InvalidPersistedValue {
            field: "session_status",
            value: value.to_string(),
        })
}
