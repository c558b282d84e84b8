use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const HEALTH_SCORE_MIN: i64 = 0;
pub const HEALTH_SCORE_MAX: i64 = 100;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("external conversation id must not be empty")]
    EmptyExternalId,
    #[error("message list must not be empty")]
    EmptyMessages,
    #[error("message {index}: unknown role: {role}")]
    UnknownRole { index: usize, role: String },
    #[error("message {index}: content must not be empty")]
    EmptyContent { index: usize },
    #[error("message {index}: unparseable timestamp: {value}")]
    BadTimestamp { index: usize, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Completed,
    Abandoned,
}

impl Default for ConversationStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "completed" => Ok(ConversationStatus::Completed),
            "abandoned" => Ok(ConversationStatus::Abandoned),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Loop,
    Frustration,
    Nonsense,
    AbruptEnd,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Loop => "loop",
            FailureKind::Frustration => "frustration",
            FailureKind::Nonsense => "nonsense",
            FailureKind::AbruptEnd => "abrupt_end",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "loop" => Ok(FailureKind::Loop),
            "frustration" => Ok(FailureKind::Frustration),
            "nonsense" => Ok(FailureKind::Nonsense),
            "abrupt_end" => Ok(FailureKind::AbruptEnd),
            other => Err(format!("Unknown failure kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Open,
    Ack,
    Resolved,
}

impl Default for FailureStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Open => "open",
            FailureStatus::Ack => "ack",
            FailureStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "open" => Ok(FailureStatus::Open),
            "ack" => Ok(FailureStatus::Ack),
            "resolved" => Ok(FailureStatus::Resolved),
            other => Err(format!("Unknown failure status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub external_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub health_score: Option<i64>,
    pub status: ConversationStatus,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub ts: DateTime<Utc>,
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub ts: DateTime<Utc>,
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub id: String,
    pub conversation_id: String,
    pub kind: FailureKind,
    pub detected_at: DateTime<Utc>,
    pub status: FailureStatus,
    pub alerted: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectedFailure {
    pub kind: FailureKind,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsagePattern {
    pub id: String,
    pub name: String,
    pub description: String,
    pub occurrence_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEmbedding {
    pub conversation_id: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Inbound tracking payload as produced by an external client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    #[serde(rename = "conversationId")]
    pub external_id: String,
    pub messages: Vec<IngestMessage>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Validated ingestion batch with parsed roles and timestamps and the
/// conversation time bounds derived from the message set.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub external_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub messages: Vec<NewMessage>,
    pub metadata: Option<Value>,
}

impl IngestRequest {
    /// Validate the request and resolve it into a [`NormalizedBatch`].
    ///
    /// Returns the first validation failure; nothing is normalized partially.
    pub fn normalize(&self) -> Result<NormalizedBatch, ValidationError> {
        if self.external_id.trim().is_empty() {
            return Err(ValidationError::EmptyExternalId);
        }
        if self.messages.is_empty() {
            return Err(ValidationError::EmptyMessages);
        }

        let mut messages = Vec::with_capacity(self.messages.len());
        for (index, message) in self.messages.iter().enumerate() {
            let role = message
                .role
                .parse::<MessageRole>()
                .map_err(|_| ValidationError::UnknownRole {
                    index,
                    role: message.role.clone(),
                })?;
            if message.content.trim().is_empty() {
                return Err(ValidationError::EmptyContent { index });
            }
            let ts = DateTime::parse_from_rfc3339(&message.timestamp)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| ValidationError::BadTimestamp {
                    index,
                    value: message.timestamp.clone(),
                })?;

            messages.push(NewMessage {
                role,
                content: message.content.clone(),
                ts,
                sentiment_score: None,
                metadata: message.metadata.clone().unwrap_or(Value::Object(Default::default())),
            });
        }

        let started_at = messages
            .iter()
            .map(|message| message.ts)
            .min()
            .expect("non-empty message list");
        let ended_at = messages
            .iter()
            .map(|message| message.ts)
            .max()
            .expect("non-empty message list");

        Ok(NormalizedBatch {
            external_id: self.external_id.clone(),
            started_at,
            ended_at,
            messages,
            metadata: self.metadata.clone(),
        })
    }
}

/// Clamp a raw score into the valid health range.
pub fn clamp_health_score(score: i64) -> i64 {
    score.clamp(HEALTH_SCORE_MIN, HEALTH_SCORE_MAX)
}
