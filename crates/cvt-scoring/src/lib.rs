use chrono::{DateTime, Utc};
use cvt_core::{clamp_health_score, DetectedFailure, FailureKind, Message, MessageRole};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const BASE_SCORE: i64 = 100;
const GRATITUDE_BONUS_SIMPLE: i64 = 5;
const GRATITUDE_BONUS_BREAKDOWN: i64 = 10;
const CLARIFICATION_PENALTY_STEP: i64 = 10;
const CLARIFICATION_PENALTY_CAP: usize = 3;
const UNFINISHED_PENALTY: i64 = 30;
const SENTIMENT_DROP_PENALTY: i64 = 20;
const SENTIMENT_DROP_THRESHOLD: f64 = 0.5;
const FRUSTRATION_CLARIFICATION_MIN: usize = 2;
const LOOP_ASSISTANT_MIN: usize = 6;

static GRATITUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)thank(s| you)").expect("valid regex"));

static CLARIFICATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)that's not",
        r"(?i)I meant",
        r"(?i)not what",
        r"(?i)try again",
        r"(?i)doesn't work",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

/// Result of the live scoring path: gratitude and clarification signals only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleScore {
    pub score: i64,
    pub clarifications: usize,
    pub gratitude: bool,
}

/// Per-factor adjustments reported alongside the richer scoring variant.
/// Penalties are negative, bonuses positive, zero when a factor did not apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub completion: i64,
    pub sentiment: i64,
    pub clarifications: i64,
    pub bonuses: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakdownScore {
    pub score: i64,
    pub breakdown: ScoreBreakdown,
}

/// Live scoring variant: base 100, +5 when any user message expresses
/// gratitude, -10 per clarification match saturating at three matches,
/// clamped to [0, 100].
pub fn score_simple(messages: &[Message]) -> SimpleScore {
    let clarifications = clarification_count(messages);
    let gratitude = has_gratitude(messages);

    let mut score = BASE_SCORE;
    if gratitude {
        score += GRATITUDE_BONUS_SIMPLE;
    }
    score -= clarification_penalty(clarifications);

    SimpleScore {
        score: clamp_health_score(score),
        clarifications,
        gratitude,
    }
}

/// Breakdown scoring variant: the same clarification penalty, a +10 gratitude
/// bonus reported separately, -30 when the conversation never ended, and -20
/// when sentiment fell by more than 0.5 between the first and last message.
pub fn score_with_breakdown(
    messages: &[Message],
    ended_at: Option<DateTime<Utc>>,
) -> BreakdownScore {
    let clarifications = clarification_count(messages);
    let gratitude = has_gratitude(messages);

    let completion = if ended_at.is_none() {
        -UNFINISHED_PENALTY
    } else {
        0
    };
    let sentiment = if sentiment_dropped(messages) {
        -SENTIMENT_DROP_PENALTY
    } else {
        0
    };
    let clarification_adjustment = -clarification_penalty(clarifications);
    let bonuses = if gratitude {
        GRATITUDE_BONUS_BREAKDOWN
    } else {
        0
    };

    let score = BASE_SCORE + completion + sentiment + clarification_adjustment + bonuses;

    BreakdownScore {
        score: clamp_health_score(score),
        breakdown: ScoreBreakdown {
            completion,
            sentiment,
            clarifications: clarification_adjustment,
            bonuses,
        },
    }
}

/// Failure inference over the same message scan: `frustration` at two or more
/// clarification matches, `loop` at six or more assistant messages. No other
/// failure kinds are produced here.
pub fn infer_failures(messages: &[Message], detected_at: DateTime<Utc>) -> Vec<DetectedFailure> {
    let mut failures = Vec::new();

    if clarification_count(messages) >= FRUSTRATION_CLARIFICATION_MIN {
        failures.push(DetectedFailure {
            kind: FailureKind::Frustration,
            detected_at,
        });
    }

    let assistant_count = messages
        .iter()
        .filter(|message| message.role == MessageRole::Assistant)
        .count();
    if assistant_count >= LOOP_ASSISTANT_MIN {
        failures.push(DetectedFailure {
            kind: FailureKind::Loop,
            detected_at,
        });
    }

    failures
}

/// Number of messages (any role) matching at least one clarification pattern.
pub fn clarification_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|message| {
            CLARIFICATION_PATTERNS
                .iter()
                .any(|pattern| pattern.is_match(&message.content))
        })
        .count()
}

fn clarification_penalty(clarifications: usize) -> i64 {
    CLARIFICATION_PENALTY_STEP * clarifications.min(CLARIFICATION_PENALTY_CAP) as i64
}

fn has_gratitude(messages: &[Message]) -> bool {
    messages
        .iter()
        .filter(|message| message.role == MessageRole::User)
        .any(|message| GRATITUDE.is_match(&message.content))
}

fn sentiment_dropped(messages: &[Message]) -> bool {
    let first = messages.first().and_then(|message| message.sentiment_score);
    let last = messages.last().and_then(|message| message.sentiment_score);
    match (first, last) {
        (Some(first), Some(last)) => first - last > SENTIMENT_DROP_THRESHOLD,
        _ => false,
    }
}
