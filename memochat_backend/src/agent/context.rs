//! Builds the system block that carries stored knowledge into a completion
//! request.
//!
//! Gathering is split from rendering so the HTTP layer can show what would
//! be injected, and so rendering can be tested without a database.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::patterns::{
    preference_number, ASKS_QUESTIONS_KEY, AVG_MESSAGE_LENGTH_KEY, MESSAGE_COUNT_KEY,
    PREFERS_CODE_KEY, REQUESTS_EXPLANATION_KEY,
};
use crate::config::MemoryScope;
use crate::database::{ChatDatabase, Memory, Task};
use crate::llm_client::ChatMessage;
use crate::payload::{CurrentTaskState, MemoryKind, PreferenceMap, StateKind, StatePayload};

const MAX_ACTIVE_TASKS: usize = 3;
const MEMORY_PREVIEW_CHARS: usize = 150;

/// Memory kinds surfaced in the block, with how many of each.
fn memory_quotas() -> [(MemoryKind, usize); 3] {
    [
        (MemoryKind::ImportantFacts, 2),
        (MemoryKind::Patterns, 2),
        (MemoryKind::SuccessfulInteractions, 1),
    ]
}

/// Keys that drive adaptations (or are bookkeeping) and are never echoed verbatim.
const CONSUMED_KEYS: &[&str] = &[
    MESSAGE_COUNT_KEY,
    AVG_MESSAGE_LENGTH_KEY,
    ASKS_QUESTIONS_KEY,
    PREFERS_CODE_KEY,
    REQUESTS_EXPLANATION_KEY,
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextSnapshot {
    pub tasks: Vec<Task>,
    pub current_focus: Option<CurrentTaskState>,
    /// Behavioral directives derived from preference counters.
    pub adaptations: Vec<String>,
    /// Free-form preferences, rendered as `User prefers key: value`.
    pub stated_preferences: Vec<String>,
    pub memories: Vec<Memory>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.current_focus.is_none()
            && self.adaptations.is_empty()
            && self.stated_preferences.is_empty()
            && self.memories.is_empty()
    }

    /// Render the instruction block, or `None` when nothing was gathered.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut out = String::from(
            "You are an assistant with persistent memory of this user. \
             The notes below come from earlier conversations.\n\n",
        );
        out.push_str("MEMORY UTILIZATION INSTRUCTIONS:\n");
        out.push_str("• Treat the notes as background knowledge, not as part of the current message\n");
        out.push_str("• Prefer the user's latest message when it conflicts with a note\n");

        if !self.adaptations.is_empty() || !self.stated_preferences.is_empty() {
            out.push_str("\nBEHAVIORAL ADAPTATION GUIDELINES:\n");
            out.push_str("ADAPT YOUR RESPONSES:\n");
            for line in self.adaptations.iter().chain(&self.stated_preferences) {
                out.push_str("• ");
                out.push_str(line);
                out.push('\n');
            }
        }

        if !self.tasks.is_empty() || self.current_focus.is_some() {
            out.push_str("\nACTIVE TASKS:\n");
            for task in &self.tasks {
                out.push_str(&format!("• {} (priority {})", task.task_name, task.priority));
                if !task.description.trim().is_empty() {
                    out.push_str(&format!(": {}", task.description.trim()));
                }
                out.push('\n');
            }
            if let Some(focus) = &self.current_focus {
                out.push_str(&format!("• Current focus: {}\n", focus.task));
            }
        }

        if !self.memories.is_empty() {
            out.push_str("\nIMPORTANT CONTEXT:\n");
            for memory in &self.memories {
                out.push_str(&format!(
                    "• [{}] {}\n",
                    memory_label(&memory.memory_type),
                    truncate_chars(&memory.content, MEMORY_PREVIEW_CHARS)
                ));
            }
        }

        out.push_str("\nRESPONSE GUIDELINES:\n");
        out.push_str(
            "• Use this information naturally; do not recite it or mention that you have notes\n",
        );
        Some(out)
    }
}

fn memory_label(kind: &MemoryKind) -> &str {
    match kind {
        MemoryKind::ImportantFacts => "fact",
        MemoryKind::Patterns => "pattern",
        MemoryKind::SuccessfulInteractions => "worked before",
        other => other.as_str(),
    }
}

/// Cut to `max` characters on a char boundary, appending `...` when cut.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Directives triggered by the pattern counters.
pub fn adaptations_for(preferences: &PreferenceMap) -> Vec<String> {
    let mut lines = Vec::new();
    if preference_number(preferences, PREFERS_CODE_KEY) > 2.0 {
        lines.push(
            "Include code examples proactively; this user often asks for code".to_string(),
        );
    }
    if preference_number(preferences, ASKS_QUESTIONS_KEY) > 3.0 {
        lines.push(
            "Anticipate follow-up questions and answer the likely next one briefly".to_string(),
        );
    }
    if preference_number(preferences, REQUESTS_EXPLANATION_KEY) > 2.0 {
        lines.push("Be thorough in explanations; cover the reasoning, not just the answer".to_string());
    }

    let avg_length = preference_number(preferences, AVG_MESSAGE_LENGTH_KEY);
    let message_count = preference_number(preferences, MESSAGE_COUNT_KEY);
    if avg_length > 100.0 {
        lines.push("The user writes long messages; longer, detailed responses are welcome".to_string());
    } else if preferences.contains_key(AVG_MESSAGE_LENGTH_KEY)
        && avg_length < 20.0
        && message_count >= 3.0
    {
        lines.push("The user writes short messages; keep responses concise".to_string());
    }
    lines
}

/// `User prefers key: value` for string preferences outside the counters.
pub fn stated_preferences(preferences: &PreferenceMap) -> Vec<String> {
    preferences
        .iter()
        .filter(|(key, _)| !CONSUMED_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| match value {
            Value::String(text) if !text.trim().is_empty() => {
                Some(format!("User prefers {}: {}", key, text.trim()))
            }
            _ => None,
        })
        .collect()
}

#[derive(Clone)]
pub struct ContextAssembler {
    db: Arc<ChatDatabase>,
    memory_scope: MemoryScope,
}

impl ContextAssembler {
    pub fn new(db: Arc<ChatDatabase>, memory_scope: MemoryScope) -> Self {
        Self { db, memory_scope }
    }

    pub fn memory_scope(&self) -> MemoryScope {
        self.memory_scope
    }

    /// Collect everything the block would show for `conversation_id`.
    pub fn gather(&self, conversation_id: &str) -> Result<ContextSnapshot> {
        let mut tasks = self.db.get_active_tasks(conversation_id)?;
        tasks.truncate(MAX_ACTIVE_TASKS);

        let preferences = self.db.get_preferences(conversation_id)?;
        let current_focus = match self.db.get_state(conversation_id, &StateKind::CurrentTask)? {
            Some(StatePayload::CurrentTask(task)) if !task.task.trim().is_empty() => Some(task),
            _ => None,
        };

        let mut memories = Vec::new();
        for (kind, quota) in memory_quotas() {
            let found = match self.memory_scope {
                MemoryScope::Global => self.db.retrieve_memories(&kind, quota)?,
                MemoryScope::Conversation => {
                    self.db
                        .retrieve_memories_for_conversation(conversation_id, &kind, quota)?
                }
            };
            memories.extend(found);
        }

        Ok(ContextSnapshot {
            tasks,
            current_focus,
            adaptations: adaptations_for(&preferences),
            stated_preferences: stated_preferences(&preferences),
            memories,
        })
    }

    /// Prepend the context block as a system message. The input comes back
    /// unchanged when there is nothing to add or the store cannot be read.
    pub fn enrich(&self, conversation_id: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let block = match self.gather(conversation_id) {
            Ok(snapshot) => snapshot.render(),
            Err(e) => {
                tracing::warn!(
                    "Context assembly failed for {}; sending without it: {}",
                    conversation_id,
                    e
                );
                None
            }
        };

        match block {
            Some(block) => {
                tracing::debug!(
                    "Injecting {} chars of context into {}",
                    block.len(),
                    conversation_id
                );
                let mut enriched = Vec::with_capacity(messages.len() + 1);
                enriched.push(ChatMessage::system(block));
                enriched.extend(messages);
                enriched
            }
            None => messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Arc<ChatDatabase>, String) {
        let db = Arc::new(ChatDatabase::open_in_memory().expect("db init"));
        let conversation = db.create_conversation(Some("context")).expect("create");
        (db, conversation.id)
    }

    fn question() -> Vec<ChatMessage> {
        vec![ChatMessage::user(
            "How should I structure my Flask authentication routes?",
        )]
    }

    #[test]
    fn empty_store_adds_nothing() {
        let (db, id) = setup();
        let assembler = ContextAssembler::new(db, MemoryScope::Global);
        assert_eq!(assembler.enrich(&id, question()), question());
    }

    #[test]
    fn bookkeeping_only_preferences_add_nothing() {
        let (db, id) = setup();
        db.store_preference(&id, MESSAGE_COUNT_KEY, json!(2))
            .expect("store");
        let assembler = ContextAssembler::new(db, MemoryScope::Global);
        assert_eq!(assembler.enrich(&id, question()), question());
    }

    #[test]
    fn full_store_renders_every_section() {
        let (db, id) = setup();
        for (key, value) in [
            (PREFERS_CODE_KEY, json!(5)),
            (ASKS_QUESTIONS_KEY, json!(4)),
            (REQUESTS_EXPLANATION_KEY, json!(3)),
            (AVG_MESSAGE_LENGTH_KEY, json!(150)),
            ("language", json!("Python")),
            ("framework", json!("Flask")),
        ] {
            db.store_preference(&id, key, value).expect("pref");
        }
        db.create_task(&id, "Build REST API", Some("Flask auth API"), 3)
            .expect("task");
        db.create_task(&id, "Database design", None, 2).expect("task");
        db.store_memory(
            Some(&id),
            &MemoryKind::ImportantFacts,
            "User is building a Flask authentication system",
            3,
        )
        .expect("fact");
        db.store_memory(
            Some(&id),
            &MemoryKind::SuccessfulInteractions,
            &"x".repeat(400),
            2,
        )
        .expect("long memory");

        let assembler = ContextAssembler::new(db, MemoryScope::Global);
        let enriched = assembler.enrich(&id, question());
        assert_eq!(enriched.len(), 2);
        assert_eq!(enriched[0].role, "system");
        assert_eq!(enriched[1], question()[0]);

        let block = &enriched[0].content;
        for header in [
            "MEMORY UTILIZATION INSTRUCTIONS",
            "BEHAVIORAL ADAPTATION GUIDELINES",
            "ADAPT YOUR RESPONSES",
            "ACTIVE TASKS",
            "IMPORTANT CONTEXT",
            "RESPONSE GUIDELINES",
        ] {
            assert!(block.contains(header), "missing {}", header);
        }
        assert!(block.contains("code examples"));
        assert!(block.contains("thorough in explanations"));
        assert!(block.contains("User prefers framework: Flask"));
        assert!(block.find("Build REST API") < block.find("Database design"));
        assert!(block.contains(&format!("{}...", "x".repeat(150))));
        assert!(!block.contains(&"x".repeat(151)));
    }

    #[test]
    fn code_directive_follows_the_counter() {
        let (db, id) = setup();
        let assembler = ContextAssembler::new(db.clone(), MemoryScope::Global);

        db.store_preference(&id, PREFERS_CODE_KEY, json!(3))
            .expect("store");
        let block = assembler.gather(&id).expect("gather").render().expect("block");
        assert!(block.contains("code examples"));

        db.store_preference(&id, PREFERS_CODE_KEY, json!(0))
            .expect("reset");
        let snapshot = assembler.gather(&id).expect("gather");
        assert!(snapshot.render().is_none());
    }

    #[test]
    fn only_top_three_tasks_and_current_focus_are_shown() {
        let (db, id) = setup();
        for priority in 1..=5 {
            db.create_task(&id, &format!("task-{}", priority), None, priority)
                .expect("task");
        }
        db.store_state(
            &id,
            &StatePayload::CurrentTask(CurrentTaskState {
                task: "Ship the release".to_string(),
                task_id: None,
                notes: None,
            }),
        )
        .expect("focus");

        let snapshot = ContextAssembler::new(db, MemoryScope::Global)
            .gather(&id)
            .expect("gather");
        let names: Vec<&str> = snapshot.tasks.iter().map(|t| t.task_name.as_str()).collect();
        assert_eq!(names, vec!["task-5", "task-4", "task-3"]);
        let block = snapshot.render().expect("block");
        assert!(block.contains("Current focus: Ship the release"));
        assert!(!block.contains("task-2"));
    }

    #[test]
    fn memory_scope_controls_cross_conversation_visibility() {
        let (db, origin) = setup();
        let other = db.create_conversation(Some("other")).expect("other").id;
        db.store_memory(Some(&origin), &MemoryKind::ImportantFacts, "X", 3)
            .expect("store");

        let global = ContextAssembler::new(db.clone(), MemoryScope::Global)
            .gather(&other)
            .expect("global");
        assert_eq!(global.memories.len(), 1);

        let scoped = ContextAssembler::new(db, MemoryScope::Conversation)
            .gather(&other)
            .expect("scoped");
        assert!(scoped.memories.is_empty());
        assert!(scoped.render().is_none());
    }

    #[test]
    fn short_messages_ask_for_concise_answers() {
        let mut preferences = PreferenceMap::new();
        preferences.insert(AVG_MESSAGE_LENGTH_KEY.to_string(), json!(12.5));
        preferences.insert(MESSAGE_COUNT_KEY.to_string(), json!(2));
        assert!(adaptations_for(&preferences).is_empty());

        preferences.insert(MESSAGE_COUNT_KEY.to_string(), json!(3));
        let lines = adaptations_for(&preferences);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("concise"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_chars("short", 150), "short");
    }
}
