use chrono::{DateTime, Utc};
use cvt_core::{IngestRequest, ValidationError};
use cvt_storage::{ConversationStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Validates and normalizes an inbound batch and performs the conversation
/// upsert. Processing is chained by the job layer, not here.
pub struct IngestionCoordinator {
    store: Arc<Mutex<ConversationStore>>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<Mutex<ConversationStore>>) -> Self {
        Self { store }
    }

    /// Upsert the conversation named by the request's external id together
    /// with its messages, atomically, and return the internal conversation
    /// id. Validation failures reject the whole request; nothing is written.
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        now: DateTime<Utc>,
    ) -> Result<String, IngestError> {
        let batch = request.normalize()?;

        let conversation_id = self
            .store
            .lock()
            .await
            .upsert_conversation_with_messages(&batch, now)?;

        info!(
            external_id = %batch.external_id,
            conversation_id = %conversation_id,
            messages = batch.messages.len(),
            "ingested conversation"
        );

        Ok(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvt_core::IngestMessage;
    use chrono::TimeZone;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn store() -> Arc<Mutex<ConversationStore>> {
        Arc::new(Mutex::new(
            ConversationStore::open_in_memory().expect("open db"),
        ))
    }

    fn request(external_id: &str, contents: &[(&str, &str)]) -> IngestRequest {
        IngestRequest {
            external_id: external_id.to_string(),
            messages: contents
                .iter()
                .enumerate()
                .map(|(index, (role, content))| IngestMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                    timestamp: ts(index as i64 * 1_000).to_rfc3339(),
                    metadata: None,
                })
                .collect(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn ingest_persists_conversation_and_returns_internal_id() {
        let store = store();
        let coordinator = IngestionCoordinator::new(store.clone());

        let id = coordinator
            .ingest(
                &request("ext-ing-1", &[("user", "hello"), ("assistant", "hi")]),
                ts(10_000),
            )
            .await
            .expect("ingest");

        let guard = store.lock().await;
        let conversation = guard
            .conversation(&id)
            .expect("load")
            .expect("conversation exists");
        assert_eq!(conversation.external_id.as_deref(), Some("ext-ing-1"));
        assert_eq!(guard.message_count(&id).expect("count"), 2);
    }

    #[tokio::test]
    async fn invalid_request_writes_nothing() {
        let store = store();
        let coordinator = IngestionCoordinator::new(store.clone());

        let err = coordinator
            .ingest(
                &request("ext-ing-2", &[("user", "hello"), ("operator", "hi")]),
                ts(0),
            )
            .await
            .expect_err("must reject");
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::UnknownRole { index: 1, .. })
        ));

        assert_eq!(store.lock().await.conversation_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn reingest_updates_the_same_conversation() {
        let store = store();
        let coordinator = IngestionCoordinator::new(store.clone());

        let first = coordinator
            .ingest(&request("ext-ing-3", &[("user", "hello")]), ts(0))
            .await
            .expect("first ingest");
        let second = coordinator
            .ingest(
                &request("ext-ing-3", &[("user", "hello"), ("assistant", "again")]),
                ts(1_000),
            )
            .await
            .expect("second ingest");

        assert_eq!(first, second);
        let guard = store.lock().await;
        assert_eq!(guard.conversation_count().expect("count"), 1);
        assert_eq!(guard.message_count(&first).expect("count"), 3);
    }
}
