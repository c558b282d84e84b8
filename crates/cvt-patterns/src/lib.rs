use chrono::{DateTime, Utc};
use cvt_core::Message;
use cvt_storage::{ConversationStore, StorageError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub const PATTERN_GREETING: &str = "greeting";
pub const PATTERN_QUESTION_HEAVY: &str = "question-heavy";
pub const PATTERN_TECHNICAL: &str = "technical";
pub const PATTERN_HELP_REQUEST: &str = "help-request";
pub const PATTERN_POSITIVE_FEEDBACK: &str = "positive-feedback";
pub const PATTERN_CLARIFICATION_NEEDED: &str = "clarification-needed";
pub const PATTERN_EXTENDED_CONVERSATION: &str = "extended-conversation";

const QUESTION_HEAVY_MIN: usize = 3;
const EXTENDED_CONVERSATION_MIN: usize = 10;

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)hello|hi|hey|good morning|good afternoon|good evening").expect("valid regex")
});
static TECHNICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)api|code|function|error|debug|bug|stack").expect("valid regex"));
static HELP_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)help|assist|support|problem|issue|stuck|can't|unable").expect("valid regex")
});
static POSITIVE_FEEDBACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)thank|thanks|great|awesome|perfect|excellent|good job").expect("valid regex")
});
static CLARIFICATION_NEEDED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)clarify|explain|what do you mean|not clear|confused").expect("valid regex")
});

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatternReport {
    pub detected: Vec<String>,
    pub patterns_touched: usize,
    pub links_created: usize,
}

/// Classify a transcript into zero or more named usage patterns, in detection
/// order, deduplicated. Each pattern is checked independently; a transcript
/// may match any subset.
pub fn detect_patterns(messages: &[Message]) -> Vec<String> {
    let mut detected = Vec::new();
    let full_text = messages
        .iter()
        .map(|message| message.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    if GREETING.is_match(&full_text) {
        detected.push(PATTERN_GREETING.to_string());
    }

    let questions = messages
        .iter()
        .filter(|message| message.content.contains('?'))
        .count();
    if questions >= QUESTION_HEAVY_MIN {
        detected.push(PATTERN_QUESTION_HEAVY.to_string());
    }

    if TECHNICAL.is_match(&full_text) {
        detected.push(PATTERN_TECHNICAL.to_string());
    }

    if HELP_REQUEST.is_match(&full_text) {
        detected.push(PATTERN_HELP_REQUEST.to_string());
    }

    if POSITIVE_FEEDBACK.is_match(&full_text) {
        detected.push(PATTERN_POSITIVE_FEEDBACK.to_string());
    }

    if CLARIFICATION_NEEDED.is_match(&full_text) {
        detected.push(PATTERN_CLARIFICATION_NEEDED.to_string());
    }

    if messages.len() > EXTENDED_CONVERSATION_MIN {
        detected.push(PATTERN_EXTENDED_CONVERSATION.to_string());
    }

    detected
}

/// Detect patterns for a conversation's transcript and persist them: each
/// detected name is upserted (count incremented, last-seen bumped) and the
/// conversation is linked to it idempotently. An empty transcript performs no
/// writes.
pub fn record_patterns(
    store: &ConversationStore,
    conversation_id: &str,
    messages: &[Message],
    now: DateTime<Utc>,
) -> Result<PatternReport, PatternError> {
    if messages.is_empty() {
        return Ok(PatternReport::default());
    }

    let detected = detect_patterns(messages);
    let mut report = PatternReport {
        detected: detected.clone(),
        ..PatternReport::default()
    };

    for name in &detected {
        let description = format!("Auto-detected pattern: {name}");
        let pattern_id = store.upsert_pattern_by_name(name, &description, now)?;
        report.patterns_touched += 1;
        if store.link_pattern_conversation(&pattern_id, conversation_id)? {
            report.links_created += 1;
        }
    }

    Ok(report)
}
