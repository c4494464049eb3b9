use anyhow::Result;
use serde_json::{json, Value};

use crate::database::ChatDatabase;
use crate::payload::PreferenceMap;

pub const MESSAGE_COUNT_KEY: &str = "message_count";
pub const AVG_MESSAGE_LENGTH_KEY: &str = "avg_message_length";
pub const ASKS_QUESTIONS_KEY: &str = "asks_questions_count";
pub const PREFERS_CODE_KEY: &str = "prefers_code_count";
pub const REQUESTS_EXPLANATION_KEY: &str = "requests_explanation_count";

const CODE_KEYWORDS: &[&str] = &[
    "function",
    "python",
    "code",
    "example",
    "class",
    "script",
    "implement",
    "program",
    "syntax",
];

const EXPLANATION_KEYWORDS: &[&str] = &["why", "explain", "how", "what is", "understand", "difference"];

/// Signals read from one user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageSignals {
    pub length: usize,
    pub asks_question: bool,
    pub mentions_code: bool,
    pub wants_explanation: bool,
}

impl MessageSignals {
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        Self {
            length: message.chars().count(),
            asks_question: message.contains('?'),
            mentions_code: CODE_KEYWORDS.iter().any(|k| lowered.contains(k)),
            wants_explanation: EXPLANATION_KEYWORDS.iter().any(|k| lowered.contains(k)),
        }
    }
}

pub(crate) fn preference_number(preferences: &PreferenceMap, key: &str) -> f64 {
    preferences.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn bump(preferences: &mut PreferenceMap, key: &str) {
    let next = preferences.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
    preferences.insert(key.to_string(), json!(next));
}

/// Fold one user message into the conversation's preference counters,
/// written as a single snapshot.
pub fn analyze_user_pattern(
    db: &ChatDatabase,
    conversation_id: &str,
    message: &str,
) -> Result<PreferenceMap> {
    let signals = MessageSignals::from_message(message);

    db.update_preferences(conversation_id, |preferences| {
        let previous_count = preference_number(preferences, MESSAGE_COUNT_KEY);
        let previous_avg = preference_number(preferences, AVG_MESSAGE_LENGTH_KEY);
        let count = previous_count + 1.0;
        let avg = (previous_avg * previous_count + signals.length as f64) / count;

        preferences.insert(MESSAGE_COUNT_KEY.to_string(), json!(count as u64));
        preferences.insert(AVG_MESSAGE_LENGTH_KEY.to_string(), json!(avg));
        if signals.asks_question {
            bump(preferences, ASKS_QUESTIONS_KEY);
        }
        if signals.mentions_code {
            bump(preferences, PREFERS_CODE_KEY);
        }
        if signals.wants_explanation {
            bump(preferences, REQUESTS_EXPLANATION_KEY);
        }
    })
}
