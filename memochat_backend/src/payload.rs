//! Typed views over the JSON text stored in `agent_state.state_data` and
//! `agent_memory.content`.
//!
//! Known tags decode into dedicated types. Unknown tags are carried through
//! untouched so rows written by newer builds (or by hand) survive a round trip.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Insertion-ordered preference map (serde_json is built with `preserve_order`).
pub type PreferenceMap = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKind {
    UserPreferences,
    CurrentTask,
    ConversationSummary,
    Other(String),
}

impl StateKind {
    pub fn as_str(&self) -> &str {
        match self {
            StateKind::UserPreferences => "user_preferences",
            StateKind::CurrentTask => "current_task",
            StateKind::ConversationSummary => "conversation_summary",
            StateKind::Other(tag) => tag.as_str(),
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim() {
            "user_preferences" => StateKind::UserPreferences,
            "current_task" => StateKind::CurrentTask,
            "conversation_summary" => StateKind::ConversationSummary,
            other => StateKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentTaskState {
    #[serde(alias = "task_name", alias = "name")]
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummaryState {
    pub total_messages: usize,
    /// ISO-8601 text; older rows carry naive local timestamps.
    pub last_summarized: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub user_requests: Vec<String>,
}

/// One decoded `agent_state` snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum StatePayload {
    UserPreferences(PreferenceMap),
    CurrentTask(CurrentTaskState),
    ConversationSummary(ConversationSummaryState),
    /// Unrecognized `state_type`; `raw` is the stored text, unparsed.
    Opaque { kind: String, raw: String },
}

impl StatePayload {
    pub fn kind(&self) -> StateKind {
        match self {
            StatePayload::UserPreferences(_) => StateKind::UserPreferences,
            StatePayload::CurrentTask(_) => StateKind::CurrentTask,
            StatePayload::ConversationSummary(_) => StateKind::ConversationSummary,
            StatePayload::Opaque { kind, .. } => StateKind::from_db(kind),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let encoded = match self {
            StatePayload::UserPreferences(map) => serde_json::to_string(map),
            StatePayload::CurrentTask(task) => serde_json::to_string(task),
            StatePayload::ConversationSummary(summary) => serde_json::to_string(summary),
            StatePayload::Opaque { raw, .. } => return Ok(raw.clone()),
        };
        encoded.with_context(|| format!("Failed to encode {} state", self.kind().as_str()))
    }

    /// Decode a stored row. A recognized kind whose text does not parse is
    /// reported and treated as absent.
    pub fn decode(kind: &StateKind, raw: &str) -> Option<Self> {
        let decoded = match kind {
            StateKind::UserPreferences => {
                serde_json::from_str::<PreferenceMap>(raw).map(StatePayload::UserPreferences)
            }
            StateKind::CurrentTask => {
                serde_json::from_str::<CurrentTaskState>(raw).map(StatePayload::CurrentTask)
            }
            StateKind::ConversationSummary => serde_json::from_str::<ConversationSummaryState>(raw)
                .map(StatePayload::ConversationSummary),
            StateKind::Other(tag) => {
                return Some(StatePayload::Opaque {
                    kind: tag.clone(),
                    raw: raw.to_string(),
                })
            }
        };

        match decoded {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed {} state payload: {}",
                    kind.as_str(),
                    e
                );
                None
            }
        }
    }

    /// JSON view for API responses. Opaque text that is itself JSON is inlined.
    pub fn to_value(&self) -> Value {
        match self {
            StatePayload::UserPreferences(map) => Value::Object(map.clone()),
            StatePayload::CurrentTask(task) => serde_json::to_value(task).unwrap_or(Value::Null),
            StatePayload::ConversationSummary(summary) => {
                serde_json::to_value(summary).unwrap_or(Value::Null)
            }
            StatePayload::Opaque { raw, .. } => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
        }
    }

    pub fn into_preferences(self) -> Option<PreferenceMap> {
        match self {
            StatePayload::UserPreferences(map) => Some(map),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemoryKind {
    ImportantFacts,
    Patterns,
    SuccessfulInteractions,
    AgentDecisions,
    ResponseMetrics,
    UserPreferences,
    Other(String),
}

impl MemoryKind {
    pub fn as_str(&self) -> &str {
        match self {
            MemoryKind::ImportantFacts => "important_facts",
            MemoryKind::Patterns => "patterns",
            MemoryKind::SuccessfulInteractions => "successful_interactions",
            MemoryKind::AgentDecisions => "agent_decisions",
            MemoryKind::ResponseMetrics => "response_metrics",
            MemoryKind::UserPreferences => "user_preferences",
            MemoryKind::Other(tag) => tag.as_str(),
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim() {
            "important_facts" => MemoryKind::ImportantFacts,
            "patterns" => MemoryKind::Patterns,
            "successful_interactions" => MemoryKind::SuccessfulInteractions,
            "agent_decisions" => MemoryKind::AgentDecisions,
            "response_metrics" => MemoryKind::ResponseMetrics,
            "user_preferences" => MemoryKind::UserPreferences,
            other => MemoryKind::Other(other.to_string()),
        }
    }
}

impl From<String> for MemoryKind {
    fn from(raw: String) -> Self {
        MemoryKind::from_db(&raw)
    }
}

impl From<MemoryKind> for String {
    fn from(kind: MemoryKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDecision {
    pub context: String,
    pub decision: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub response_chars: usize,
    pub fragment_count: usize,
    pub duration_ms: u64,
    pub model: String,
}

/// Decoded `agent_memory.content`.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryPayload {
    Text(String),
    AgentDecision(AgentDecision),
    ResponseMetrics(ResponseMetrics),
}

impl MemoryPayload {
    /// Structured kinds fall back to `Text` when the content is not their JSON shape.
    pub fn decode(kind: &MemoryKind, content: &str) -> Self {
        match kind {
            MemoryKind::AgentDecisions => serde_json::from_str(content)
                .map(MemoryPayload::AgentDecision)
                .unwrap_or_else(|_| MemoryPayload::Text(content.to_string())),
            MemoryKind::ResponseMetrics => serde_json::from_str(content)
                .map(MemoryPayload::ResponseMetrics)
                .unwrap_or_else(|_| MemoryPayload::Text(content.to_string())),
            _ => MemoryPayload::Text(content.to_string()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        match self {
            MemoryPayload::Text(text) => Ok(text.clone()),
            MemoryPayload::AgentDecision(decision) => {
                serde_json::to_string(decision).context("Failed to encode agent decision")
            }
            MemoryPayload::ResponseMetrics(metrics) => {
                serde_json::to_string(metrics).context("Failed to encode response metrics")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preference_map_keeps_key_order_through_encode_decode() {
        let mut prefs = PreferenceMap::new();
        prefs.insert("zeta".to_string(), json!(1));
        prefs.insert("alpha".to_string(), json!("Python"));
        prefs.insert("mid".to_string(), json!([1, 2]));

        let payload = StatePayload::UserPreferences(prefs.clone());
        let raw = payload.encode().expect("encode");
        let decoded = StatePayload::decode(&StateKind::UserPreferences, &raw)
            .and_then(StatePayload::into_preferences)
            .expect("decode");

        let keys: Vec<&String> = decoded.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(decoded, prefs);
    }

    #[test]
    fn malformed_known_state_is_absent() {
        assert!(StatePayload::decode(&StateKind::UserPreferences, "{not json").is_none());
        assert!(StatePayload::decode(&StateKind::UserPreferences, "[1,2]").is_none());
        assert!(StatePayload::decode(&StateKind::ConversationSummary, "{}").is_none());
    }

    #[test]
    fn unknown_state_kind_is_carried_opaque() {
        let kind = StateKind::from_db("mood_tracker");
        let payload = StatePayload::decode(&kind, "not even json").expect("opaque");
        assert_eq!(
            payload,
            StatePayload::Opaque {
                kind: "mood_tracker".to_string(),
                raw: "not even json".to_string()
            }
        );
        assert_eq!(payload.encode().expect("encode"), "not even json");
        assert_eq!(payload.to_value(), json!("not even json"));
    }

    #[test]
    fn current_task_accepts_task_name_alias() {
        let payload =
            StatePayload::decode(&StateKind::CurrentTask, r#"{"task_name":"Build REST API"}"#)
                .expect("decode");
        match payload {
            StatePayload::CurrentTask(task) => assert_eq!(task.task, "Build REST API"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn memory_kind_serializes_as_tag() {
        let value = serde_json::to_value(MemoryKind::SuccessfulInteractions).expect("serialize");
        assert_eq!(value, json!("successful_interactions"));
        let parsed: MemoryKind = serde_json::from_value(json!("custom_notes")).expect("parse");
        assert_eq!(parsed, MemoryKind::Other("custom_notes".to_string()));
    }

    #[test]
    fn decision_memory_falls_back_to_text() {
        let decoded = MemoryPayload::decode(&MemoryKind::AgentDecisions, "plain note");
        assert_eq!(decoded, MemoryPayload::Text("plain note".to_string()));

        let decision = AgentDecision {
            context: "user asked for tests".to_string(),
            decision: "wrote pytest examples".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        let raw = MemoryPayload::AgentDecision(decision.clone())
            .encode()
            .expect("encode");
        assert_eq!(
            MemoryPayload::decode(&MemoryKind::AgentDecisions, &raw),
            MemoryPayload::AgentDecision(decision)
        );
    }
}
