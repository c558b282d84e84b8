use chrono::{DateTime, Utc};
use cvt_core::Message;
use cvt_storage::{ConversationStore, StorageError};
use std::collections::BTreeMap;
use thiserror::Error;

pub const EMBEDDING_DIM: usize = 50;
pub const EMBEDDING_MODEL: &str = "bow-hash-v1";

const MIN_TOKEN_LEN: usize = 3;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Render a transcript as the text the embedding is derived from: one
/// `<role>: <content>` line per message, in the order given.
pub fn transcript_text(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Project text onto a fixed-dimension vector: lowercase tokens of length
/// three or more, relative word frequency, each distinct word bucketed by its
/// character-code sum modulo the dimension count. Bucket collisions
/// accumulate. The result is L2-normalized, or all-zero when no token
/// qualifies.
///
/// This is a coarse bag-of-words projection, not a semantic embedding; the
/// only guarantees callers may rely on are determinism, fixed dimensionality,
/// and unit (or zero) magnitude.
pub fn embed_text(text: &str) -> Vec<f32> {
    let lowered = text.to_lowercase();
    let words = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| word.len() >= MIN_TOKEN_LEN)
        .collect::<Vec<_>>();

    let mut embedding = vec![0.0f32; EMBEDDING_DIM];
    if words.is_empty() {
        return embedding;
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &word in &words {
        *counts.entry(word).or_insert(0) += 1;
    }

    let total = words.len() as f32;
    for (word, count) in counts {
        let bucket = word
            .chars()
            .map(|c| c as u32)
            .sum::<u32>() as usize
            % EMBEDDING_DIM;
        embedding[bucket] += count as f32 / total;
    }

    normalize(embedding)
}

/// Embed a conversation's transcript and upsert the row; reprocessing
/// overwrites the stored vector and model tag.
pub fn embed_conversation(
    store: &ConversationStore,
    conversation_id: &str,
    messages: &[Message],
    now: DateTime<Utc>,
) -> Result<Vec<f32>, EmbeddingError> {
    let embedding = embed_text(&transcript_text(messages));
    store.upsert_embedding(conversation_id, &embedding, EMBEDDING_MODEL, now)?;
    Ok(embedding)
}

fn normalize(mut embedding: Vec<f32>) -> Vec<f32> {
    let magnitude = embedding
        .iter()
        .map(|value| value * value)
        .sum::<f32>()
        .sqrt();
    if magnitude > 0.0 {
        for value in embedding.iter_mut() {
            *value /= magnitude;
        }
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvt_core::{MessageRole, NewMessage, NormalizedBatch};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn message(role: MessageRole, content: &str, offset_ms: i64) -> Message {
        Message {
            id: format!("msg-{offset_ms}"),
            conversation_id: "conv-1".to_string(),
            role,
            content: content.to_string(),
            ts: ts(offset_ms),
            sentiment_score: None,
            metadata: json!({}),
        }
    }

    fn magnitude(embedding: &[f32]) -> f32 {
        embedding.iter().map(|value| value * value).sum::<f32>().sqrt()
    }

    #[test]
    fn transcript_renders_role_prefixed_lines_in_order() {
        let messages = vec![
            message(MessageRole::User, "how do I reset my password", 0),
            message(MessageRole::Assistant, "open settings", 1_000),
        ];
        assert_eq!(
            transcript_text(&messages),
            "user: how do I reset my password\nassistant: open settings"
        );
    }

    #[test]
    fn embedding_is_deterministic() {
        let text = "user: the api returns an error\nassistant: which endpoint";
        assert_eq!(embed_text(text), embed_text(text));
    }

    #[test]
    fn embedding_has_fixed_dimension_and_unit_norm() {
        let embedding = embed_text("assistant: restart the service and retry the export");
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        assert!((magnitude(&embedding) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn text_without_qualifying_tokens_embeds_to_zero() {
        // Every token is shorter than the three-character minimum.
        let embedding = embed_text("a an to of i it");
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        assert!(embedding.iter().all(|value| *value == 0.0));

        let empty = embed_text("");
        assert!(empty.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn colliding_words_accumulate_in_one_bucket() {
        // "abc" and "cba" share a character-code sum, so they land in the same
        // bucket and their frequencies add up instead of overwriting.
        let single = embed_text("abc");
        let collided = embed_text("abc cba");
        let bucket = single
            .iter()
            .position(|value| *value > 0.0)
            .expect("one occupied bucket");

        assert_eq!(
            collided.iter().filter(|value| **value > 0.0).count(),
            1,
            "both words share the bucket"
        );
        assert!(collided[bucket] > 0.0);
    }

    #[test]
    fn distinct_texts_disagree_somewhere() {
        let left = embed_text("user: billing question about invoices");
        let right = embed_text("assistant: kernel panic in the driver");
        assert_ne!(left, right);
    }

    #[test]
    fn embed_conversation_upserts_one_row_per_conversation() {
        let file = NamedTempFile::new().expect("temp db");
        let mut store = ConversationStore::open(file.path()).expect("open store");
        let batch = NormalizedBatch {
            external_id: "ext-emb-1".to_string(),
            started_at: ts(0),
            ended_at: ts(1_000),
            messages: vec![NewMessage {
                role: MessageRole::User,
                content: "hello there".to_string(),
                ts: ts(0),
                sentiment_score: None,
                metadata: json!({}),
            }],
            metadata: None,
        };
        let conversation_id = store
            .upsert_conversation_with_messages(&batch, ts(1_000))
            .expect("seed conversation");

        let first_messages = vec![message(MessageRole::User, "hello there", 0)];
        let first = embed_conversation(&store, &conversation_id, &first_messages, ts(2_000))
            .expect("first embed");

        let second_messages = vec![message(MessageRole::User, "completely different words", 0)];
        let second = embed_conversation(&store, &conversation_id, &second_messages, ts(3_000))
            .expect("second embed");

        assert_ne!(first, second);
        let stored = store
            .embedding(&conversation_id)
            .expect("load")
            .expect("row exists");
        assert_eq!(stored.embedding, second);
        assert_eq!(stored.model, EMBEDDING_MODEL);
    }
}
