use chrono::{DateTime, Utc};
use cvt_core::{
    Conversation, ConversationEmbedding, ConversationStatus, DetectedFailure, Failure,
    FailureStatus, Message, NormalizedBatch, UsagePattern,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const CONVERSATION_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("conversation not found: {0}")]
    MissingConversation(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub struct ConversationStore {
    conn: Connection,
}

impl ConversationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CONVERSATION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONVERSATION_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_conversation_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Insert or update a conversation keyed by its external id and append the
    /// batch's messages in one transaction. The conversation and its new
    /// messages become visible together or not at all.
    ///
    /// Messages are appended without deduplication; re-ingesting an
    /// overlapping batch produces duplicate message rows.
    pub fn upsert_conversation_with_messages(
        &mut self,
        batch: &NormalizedBatch,
        now: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let metadata_json = batch
            .metadata
            .as_ref()
            .map(|metadata| {
                serde_json::to_string(metadata)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;

        let tx = self.conn.transaction()?;

        let existing: Option<(String, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT id, started_at, ended_at FROM conversations WHERE external_id = ?1",
                [&batch.external_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let conversation_id = match existing {
            Some((id, started_at, ended_at)) => {
                // Messages accumulate across batches, so the time bounds widen
                // to the union of everything seen for this conversation.
                let started_at = match started_at.map(parse_timestamp).transpose()? {
                    Some(existing_start) => existing_start.min(batch.started_at),
                    None => batch.started_at,
                };
                let ended_at = match ended_at.map(parse_timestamp).transpose()? {
                    Some(existing_end) => existing_end.max(batch.ended_at),
                    None => batch.ended_at,
                };

                tx.execute(
                    "
                    UPDATE conversations SET
                        started_at = ?2,
                        ended_at = ?3,
                        status = ?4,
                        metadata_json = COALESCE(?5, metadata_json),
                        updated_at = ?6
                    WHERE id = ?1
                    ",
                    params![
                        id,
                        started_at.to_rfc3339(),
                        ended_at.to_rfc3339(),
                        ConversationStatus::Completed.as_str(),
                        metadata_json,
                        now.to_rfc3339(),
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "
                    INSERT INTO conversations (
                        id,
                        external_id,
                        started_at,
                        ended_at,
                        status,
                        metadata_json,
                        created_at,
                        updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                    ",
                    params![
                        id,
                        batch.external_id,
                        batch.started_at.to_rfc3339(),
                        batch.ended_at.to_rfc3339(),
                        ConversationStatus::Completed.as_str(),
                        metadata_json.unwrap_or_else(|| "{}".to_string()),
                        now.to_rfc3339(),
                    ],
                )?;
                id
            }
        };

        for message in &batch.messages {
            let message_metadata = serde_json::to_string(&message.metadata)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            tx.execute(
                "
                INSERT INTO messages (
                    id,
                    conversation_id,
                    role,
                    content,
                    ts,
                    sentiment_score,
                    metadata_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id,
                    message.role.as_str(),
                    message.content,
                    message.ts.to_rfc3339(),
                    message.sentiment_score,
                    message_metadata,
                ],
            )?;
        }

        tx.commit()?;
        Ok(conversation_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, external_id, started_at, ended_at, health_score, status,
                       metadata_json, created_at, updated_at
                FROM conversations
                WHERE id = ?1
                ",
                [conversation_id],
                |row| {
                    let status_raw: String = row.get(5)?;
                    let status = parse_enum::<ConversationStatus>(5, &status_raw)?;
                    let metadata_json: String = row.get(6)?;
                    let metadata = parse_json(6, &metadata_json)?;

                    Ok(Conversation {
                        id: row.get(0)?,
                        external_id: row.get(1)?,
                        started_at: parse_optional_ts(row, 2)?,
                        ended_at: parse_optional_ts(row, 3)?,
                        health_score: row.get(4)?,
                        status,
                        metadata,
                        created_at: parse_ts(row, 7)?,
                        updated_at: parse_ts(row, 8)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    pub fn conversation_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM conversations WHERE external_id = ?1",
                [external_id],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(id) => self.conversation(&id),
            None => Ok(None),
        }
    }

    pub fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, conversation_id, role, content, ts, sentiment_score, metadata_json
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY ts ASC, id ASC
            ",
        )?;

        let rows = statement.query_map([conversation_id], |row| {
            let role_raw: String = row.get(2)?;
            let role = parse_enum::<cvt_core::MessageRole>(2, &role_raw)?;
            let metadata_json: String = row.get(6)?;
            let metadata = parse_json(6, &metadata_json)?;

            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role,
                content: row.get(3)?,
                ts: parse_ts(row, 4)?,
                sentiment_score: row.get(5)?,
                metadata,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn message_count(&self, conversation_id: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn conversation_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn set_health_score(
        &self,
        conversation_id: &str,
        score: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE conversations SET health_score = ?2, updated_at = ?3 WHERE id = ?1",
            params![conversation_id, score, now.to_rfc3339()],
        )?;
        if changes == 0 {
            return Err(StorageError::MissingConversation(
                conversation_id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![conversation_id, status.as_str(), now.to_rfc3339()],
        )?;
        if changes == 0 {
            return Err(StorageError::MissingConversation(
                conversation_id.to_string(),
            ));
        }
        Ok(())
    }

    /// Insert failure rows for a conversation; returns the new ids in input
    /// order. Rows start in `open` status with the alerted flag clear.
    pub fn insert_failures(
        &self,
        conversation_id: &str,
        failures: &[DetectedFailure],
    ) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::with_capacity(failures.len());
        for failure in failures {
            let id = Uuid::new_v4().to_string();
            self.conn.execute(
                "
                INSERT INTO failures (id, conversation_id, kind, detected_at, status, alerted)
                VALUES (?1, ?2, ?3, ?4, ?5, 0)
                ",
                params![
                    id,
                    conversation_id,
                    failure.kind.as_str(),
                    failure.detected_at.to_rfc3339(),
                    FailureStatus::Open.as_str(),
                ],
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn mark_failures_alerted(&self, failure_ids: &[String]) -> Result<(), StorageError> {
        for failure_id in failure_ids {
            self.conn.execute(
                "UPDATE failures SET alerted = 1 WHERE id = ?1",
                [failure_id],
            )?;
        }
        Ok(())
    }

    /// Status transition driven by the external failure board. `resolved_at`
    /// is set exactly when the status becomes `resolved` and cleared on any
    /// other status; the `resolved` -> `open` reset is not policed here.
    pub fn set_failure_status(
        &self,
        failure_id: &str,
        status: FailureStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let resolved_at = match status {
            FailureStatus::Resolved => Some(now.to_rfc3339()),
            FailureStatus::Open | FailureStatus::Ack => None,
        };
        self.conn.execute(
            "UPDATE failures SET status = ?2, resolved_at = ?3 WHERE id = ?1",
            params![failure_id, status.as_str(), resolved_at],
        )?;
        Ok(())
    }

    pub fn failures_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Failure>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, conversation_id, kind, detected_at, status, alerted, resolved_at
            FROM failures
            WHERE conversation_id = ?1
            ORDER BY detected_at ASC, id ASC
            ",
        )?;

        let rows = statement.query_map([conversation_id], |row| {
            let kind_raw: String = row.get(2)?;
            let kind = parse_enum::<cvt_core::FailureKind>(2, &kind_raw)?;
            let status_raw: String = row.get(4)?;
            let status = parse_enum::<FailureStatus>(4, &status_raw)?;

            Ok(Failure {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                kind,
                detected_at: parse_ts(row, 3)?,
                status,
                alerted: row.get::<_, i64>(5)? != 0,
                resolved_at: parse_optional_ts(row, 6)?,
            })
        })?;

        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }

    /// Upsert a usage pattern by name: first detection inserts the row with a
    /// count of one, later detections increment the count and bump
    /// `last_seen_at`. Returns the pattern id either way.
    pub fn upsert_pattern_by_name(
        &self,
        name: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        self.conn.execute(
            "
            INSERT INTO usage_patterns (
                id,
                name,
                description,
                occurrence_count,
                first_seen_at,
                last_seen_at
            ) VALUES (?1, ?2, ?3, 1, ?4, ?4)
            ON CONFLICT(name) DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                last_seen_at = excluded.last_seen_at
            ",
            params![
                Uuid::new_v4().to_string(),
                name,
                description,
                now.to_rfc3339(),
            ],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM usage_patterns WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Link a conversation to a pattern; re-linking an existing pair is a
    /// no-op. Returns whether a new link row was created.
    pub fn link_pattern_conversation(
        &self,
        pattern_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO pattern_conversations (pattern_id, conversation_id)
            VALUES (?1, ?2)
            ",
            params![pattern_id, conversation_id],
        )?;
        Ok(changes > 0)
    }

    pub fn pattern_by_name(&self, name: &str) -> Result<Option<UsagePattern>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, name, description, occurrence_count, first_seen_at, last_seen_at,
                       embedding_json
                FROM usage_patterns
                WHERE name = ?1
                ",
                [name],
                |row| {
                    let embedding_json: Option<String> = row.get(6)?;
                    let embedding = match embedding_json {
                        Some(raw) => Some(parse_json_vec(6, &raw)?),
                        None => None,
                    };

                    Ok(UsagePattern {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        occurrence_count: row.get(3)?,
                        first_seen_at: parse_ts(row, 4)?,
                        last_seen_at: parse_ts(row, 5)?,
                        embedding,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    pub fn pattern_names_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT p.name
            FROM pattern_conversations pc
            JOIN usage_patterns p ON p.id = pc.pattern_id
            WHERE pc.conversation_id = ?1
            ORDER BY p.name ASC
            ",
        )?;

        let rows = statement.query_map([conversation_id], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    pub fn pattern_link_count(&self, conversation_id: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pattern_conversations WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// One embedding per conversation; reprocessing overwrites the prior
    /// vector and model tag.
    pub fn upsert_embedding(
        &self,
        conversation_id: &str,
        embedding: &[f32],
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let embedding_json = serde_json::to_string(embedding)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO conversation_embeddings (conversation_id, embedding_json, model, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(conversation_id) DO UPDATE SET
                embedding_json = excluded.embedding_json,
                model = excluded.model,
                created_at = excluded.created_at
            ",
            params![conversation_id, embedding_json, model, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn embedding(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationEmbedding>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT conversation_id, embedding_json, model, created_at
                FROM conversation_embeddings
                WHERE conversation_id = ?1
                ",
                [conversation_id],
                |row| {
                    let embedding_json: String = row.get(1)?;
                    let embedding = parse_json_vec(1, &embedding_json)?;

                    Ok(ConversationEmbedding {
                        conversation_id: row.get(0)?,
                        embedding,
                        model: row.get(2)?,
                        created_at: parse_ts(row, 3)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    pub fn webhook_url(&self) -> Result<Option<String>, StorageError> {
        let url: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT webhook_url FROM app_settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(url.flatten())
    }

    pub fn set_webhook_url(&self, url: Option<&str>) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO app_settings (id, webhook_url) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET webhook_url = excluded.webhook_url
            ",
            params![url],
        )?;
        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn parse_enum<T: FromStr>(column: usize, raw: &str) -> Result<T, rusqlite::Error> {
    raw.parse::<T>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid enum value: {raw}"),
            )),
        )
    })
}

fn parse_json(column: usize, raw: &str) -> Result<serde_json::Value, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn parse_json_vec(column: usize, raw: &str) -> Result<Vec<f32>, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn parse_ts(row: &rusqlite::Row<'_>, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn parse_optional_ts(
    row: &rusqlite::Row<'_>,
    column: usize,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(column)?;
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    column,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvt_core::{FailureKind, MessageRole, NewMessage};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn new_message(role: MessageRole, content: &str, at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            role,
            content: content.to_string(),
            ts: at,
            sentiment_score: None,
            metadata: json!({}),
        }
    }

    fn batch(external_id: &str, messages: Vec<NewMessage>) -> NormalizedBatch {
        let started_at = messages
            .iter()
            .map(|message| message.ts)
            .min()
            .expect("non-empty batch");
        let ended_at = messages
            .iter()
            .map(|message| message.ts)
            .max()
            .expect("non-empty batch");
        NormalizedBatch {
            external_id: external_id.to_string(),
            started_at,
            ended_at,
            messages,
            metadata: None,
        }
    }

    #[test]
    fn migration_creates_conversation_tables() {
        let store = ConversationStore::open_in_memory().expect("open db");

        for table in [
            "conversations",
            "messages",
            "failures",
            "usage_patterns",
            "pattern_conversations",
            "conversation_embeddings",
            "app_settings",
        ] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }

        assert_eq!(
            store.schema_version().expect("schema version"),
            CONVERSATION_SCHEMA_VERSION
        );
    }

    #[test]
    fn upsert_creates_conversation_and_messages_atomically() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let id = store
            .upsert_conversation_with_messages(
                &batch(
                    "ext-1",
                    vec![
                        new_message(MessageRole::User, "hello there", ts(0)),
                        new_message(MessageRole::Assistant, "hi, how can I help?", ts(1_000)),
                    ],
                ),
                ts(2_000),
            )
            .expect("upsert");

        let conversation = store
            .conversation(&id)
            .expect("load")
            .expect("conversation exists");
        assert_eq!(conversation.external_id.as_deref(), Some("ext-1"));
        assert_eq!(conversation.status, ConversationStatus::Completed);
        assert_eq!(conversation.started_at, Some(ts(0)));
        assert_eq!(conversation.ended_at, Some(ts(1_000)));
        assert_eq!(conversation.health_score, None);
        assert_eq!(store.message_count(&id).expect("count"), 2);
    }

    #[test]
    fn upsert_by_external_id_widens_bounds_without_second_row() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let first = store
            .upsert_conversation_with_messages(
                &batch(
                    "ext-2",
                    vec![new_message(MessageRole::User, "first batch", ts(10_000))],
                ),
                ts(11_000),
            )
            .expect("first upsert");

        let second = store
            .upsert_conversation_with_messages(
                &batch(
                    "ext-2",
                    vec![
                        new_message(MessageRole::User, "earlier message", ts(0)),
                        new_message(MessageRole::Assistant, "later message", ts(20_000)),
                    ],
                ),
                ts(21_000),
            )
            .expect("second upsert");

        assert_eq!(first, second);
        assert_eq!(store.conversation_count().expect("count"), 1);

        let conversation = store
            .conversation(&first)
            .expect("load")
            .expect("conversation exists");
        assert_eq!(conversation.started_at, Some(ts(0)));
        assert_eq!(conversation.ended_at, Some(ts(20_000)));

        // No message dedup: both batches' rows are present.
        assert_eq!(store.message_count(&first).expect("count"), 3);

        // A narrower batch never shrinks the union.
        store
            .upsert_conversation_with_messages(
                &batch(
                    "ext-2",
                    vec![new_message(MessageRole::User, "inside the span", ts(5_000))],
                ),
                ts(22_000),
            )
            .expect("third upsert");
        let conversation = store
            .conversation(&first)
            .expect("load")
            .expect("conversation exists");
        assert_eq!(conversation.started_at, Some(ts(0)));
        assert_eq!(conversation.ended_at, Some(ts(20_000)));
    }

    #[test]
    fn upsert_preserves_existing_metadata_when_none_supplied() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let mut first = batch(
            "ext-3",
            vec![new_message(MessageRole::User, "hello", ts(0))],
        );
        first.metadata = Some(json!({"channel": "web"}));
        let id = store
            .upsert_conversation_with_messages(&first, ts(1_000))
            .expect("first upsert");

        let second = batch(
            "ext-3",
            vec![new_message(MessageRole::User, "again", ts(2_000))],
        );
        store
            .upsert_conversation_with_messages(&second, ts(3_000))
            .expect("second upsert");

        let conversation = store
            .conversation(&id)
            .expect("load")
            .expect("conversation exists");
        assert_eq!(conversation.metadata, json!({"channel": "web"}));
    }

    #[test]
    fn messages_load_in_timestamp_order() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let id = store
            .upsert_conversation_with_messages(
                &batch(
                    "ext-4",
                    vec![
                        new_message(MessageRole::Assistant, "second", ts(5_000)),
                        new_message(MessageRole::User, "first", ts(1_000)),
                        new_message(MessageRole::User, "third", ts(9_000)),
                    ],
                ),
                ts(10_000),
            )
            .expect("upsert");

        let messages = store.messages_for_conversation(&id).expect("load");
        let contents = messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn health_score_write_requires_existing_conversation() {
        let store = ConversationStore::open_in_memory().expect("open db");
        let err = store
            .set_health_score("missing-conv", 88, ts(0))
            .expect_err("must fail");
        assert!(matches!(err, StorageError::MissingConversation(_)));
    }

    #[test]
    fn failure_rows_round_trip_with_alert_flag() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let id = store
            .upsert_conversation_with_messages(
                &batch(
                    "ext-5",
                    vec![new_message(MessageRole::User, "it doesn't work", ts(0))],
                ),
                ts(1_000),
            )
            .expect("upsert");

        let failure_ids = store
            .insert_failures(
                &id,
                &[
                    DetectedFailure {
                        kind: FailureKind::Frustration,
                        detected_at: ts(2_000),
                    },
                    DetectedFailure {
                        kind: FailureKind::Loop,
                        detected_at: ts(2_000),
                    },
                ],
            )
            .expect("insert failures");
        assert_eq!(failure_ids.len(), 2);

        store
            .mark_failures_alerted(&failure_ids[..1])
            .expect("mark alerted");

        let failures = store.failures_for_conversation(&id).expect("load");
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.status == FailureStatus::Open));
        assert_eq!(
            failures.iter().filter(|f| f.alerted).count(),
            1,
            "exactly the marked row is alerted"
        );
    }

    #[test]
    fn failure_status_transitions_maintain_resolved_at() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let id = store
            .upsert_conversation_with_messages(
                &batch("ext-6", vec![new_message(MessageRole::User, "hi", ts(0))]),
                ts(1_000),
            )
            .expect("upsert");
        let failure_ids = store
            .insert_failures(
                &id,
                &[DetectedFailure {
                    kind: FailureKind::Loop,
                    detected_at: ts(2_000),
                }],
            )
            .expect("insert");

        store
            .set_failure_status(&failure_ids[0], FailureStatus::Resolved, ts(3_000))
            .expect("resolve");
        let resolved = &store.failures_for_conversation(&id).expect("load")[0];
        assert_eq!(resolved.status, FailureStatus::Resolved);
        assert_eq!(resolved.resolved_at, Some(ts(3_000)));

        // External reset back to open clears the resolution timestamp.
        store
            .set_failure_status(&failure_ids[0], FailureStatus::Open, ts(4_000))
            .expect("reopen");
        let reopened = &store.failures_for_conversation(&id).expect("load")[0];
        assert_eq!(reopened.status, FailureStatus::Open);
        assert_eq!(reopened.resolved_at, None);
    }

    #[test]
    fn pattern_upsert_increments_count_and_bumps_last_seen() {
        let store = ConversationStore::open_in_memory().expect("open db");

        let first_id = store
            .upsert_pattern_by_name("greeting", "Auto-detected pattern: greeting", ts(0))
            .expect("first upsert");
        let second_id = store
            .upsert_pattern_by_name("greeting", "Auto-detected pattern: greeting", ts(5_000))
            .expect("second upsert");
        assert_eq!(first_id, second_id);

        let pattern = store
            .pattern_by_name("greeting")
            .expect("load")
            .expect("pattern exists");
        assert_eq!(pattern.occurrence_count, 2);
        assert_eq!(pattern.first_seen_at, ts(0));
        assert_eq!(pattern.last_seen_at, ts(5_000));
    }

    #[test]
    fn pattern_links_are_idempotent() {
        let mut store = ConversationStore::open_in_memory().expect("open db");
        let conversation_id = store
            .upsert_conversation_with_messages(
                &batch("ext-7", vec![new_message(MessageRole::User, "hello", ts(0))]),
                ts(1_000),
            )
            .expect("upsert");
        let pattern_id = store
            .upsert_pattern_by_name("greeting", "Auto-detected pattern: greeting", ts(0))
            .expect("pattern upsert");

        assert!(store
            .link_pattern_conversation(&pattern_id, &conversation_id)
            .expect("first link"));
        assert!(!store
            .link_pattern_conversation(&pattern_id, &conversation_id)
            .expect("re-link is a no-op"));
        assert_eq!(store.pattern_link_count(&conversation_id).expect("count"), 1);
    }

    #[test]
    fn embedding_upsert_overwrites_prior_vector() {
        let file = NamedTempFile::new().expect("temp db");
        let mut store = ConversationStore::open(file.path()).expect("open db");
        let id = store
            .upsert_conversation_with_messages(
                &batch("ext-8", vec![new_message(MessageRole::User, "hello", ts(0))]),
                ts(1_000),
            )
            .expect("upsert");

        store
            .upsert_embedding(&id, &[1.0, 0.0], "bow-hash-v1", ts(2_000))
            .expect("first embedding");
        store
            .upsert_embedding(&id, &[0.0, 1.0], "bow-hash-v2", ts(3_000))
            .expect("second embedding");

        let embedding = store.embedding(&id).expect("load").expect("row exists");
        assert_eq!(embedding.embedding, vec![0.0, 1.0]);
        assert_eq!(embedding.model, "bow-hash-v2");
        assert_eq!(embedding.created_at, ts(3_000));
    }

    #[test]
    fn webhook_url_round_trips_through_settings_row() {
        let store = ConversationStore::open_in_memory().expect("open db");
        assert_eq!(store.webhook_url().expect("read"), None);

        store
            .set_webhook_url(Some("https://hooks.example.com/T000/B000"))
            .expect("write");
        assert_eq!(
            store.webhook_url().expect("read").as_deref(),
            Some("https://hooks.example.com/T000/B000")
        );

        store.set_webhook_url(None).expect("clear");
        assert_eq!(store.webhook_url().expect("read"), None);
    }
}
