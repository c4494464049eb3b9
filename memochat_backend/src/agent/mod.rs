pub mod context;
pub mod patterns;

pub use context::{ContextAssembler, ContextSnapshot};
pub use patterns::analyze_user_pattern;

use anyhow::Result;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::config::ChatConfig;
use crate::database::{ChatDatabase, MessageRole, Turn};
use crate::llm_client::{ChatMessage, CompletionClient, CompletionRequest};
use crate::payload::{MemoryKind, ResponseMetrics};

const TITLE_CHARS: usize = 50;
const SESSION_PREVIEW_CHARS: usize = 100;
const SUBSTANTIAL_REPLY_CHARS: usize = 100;
const INTERACTION_PREVIEW_CHARS: usize = 50;

/// Progress of one streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Full text accumulated so far.
    Partial { content: String },
    /// Reply finished and stored.
    Done {
        conversation_id: String,
        content: String,
    },
    Error { message: String },
}

/// Per-caller chat state. The caller owns it and passes it to every turn;
/// a fresh session starts a new conversation on its first message.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    conversation_id: Option<String>,
    session_id: Option<String>,
    turns: usize,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue an existing conversation.
    pub fn resume(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Self::default()
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn turns(&self) -> usize {
        self.turns
    }
}

/// Growing partial replies for one turn. Each item is the whole text so far;
/// a failure arrives as a single `Error: ...` item. Dropping the stream
/// cancels the turn and nothing further is stored.
pub struct ReplyStream {
    conversation_id: Option<String>,
    events: BoxStream<'static, ChatEvent>,
}

impl ReplyStream {
    fn from_receiver(conversation_id: Option<String>, rx: flume::Receiver<ChatEvent>) -> Self {
        Self {
            conversation_id,
            events: rx.into_stream().boxed(),
        }
    }

    fn failed(conversation_id: Option<String>, message: String) -> Self {
        let (tx, rx) = flume::unbounded();
        let _ = tx.send(ChatEvent::Error { message });
        Self::from_receiver(conversation_id, rx)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// The typed events behind the text stream.
    pub fn into_events(self) -> BoxStream<'static, ChatEvent> {
        self.events
    }
}

impl Stream for ReplyStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        loop {
            return match self.events.poll_next_unpin(cx) {
                Poll::Ready(Some(ChatEvent::Partial { content })) => Poll::Ready(Some(content)),
                Poll::Ready(Some(ChatEvent::Error { message })) => {
                    Poll::Ready(Some(format!("Error: {}", message)))
                }
                Poll::Ready(Some(ChatEvent::Done { .. })) => continue,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

/// Title for a conversation started by `message`.
pub fn title_from_message(message: &str) -> String {
    let message = message.trim();
    match message.char_indices().nth(TITLE_CHARS) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}

fn preview(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Prior turns followed by the current message, in completion-API shape.
pub fn build_messages(prior_turns: &[Turn], message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(prior_turns.len() * 2 + 1);
    for turn in prior_turns {
        if let Some(user) = &turn.user {
            messages.push(ChatMessage::user(user.clone()));
        }
        if let Some(assistant) = turn.assistant.as_ref().filter(|text| !text.is_empty()) {
            messages.push(ChatMessage::assistant(assistant.clone()));
        }
    }
    messages.push(ChatMessage::user(message));
    messages
}

#[derive(Clone)]
pub struct ChatAgent {
    db: Arc<ChatDatabase>,
    client: Arc<dyn CompletionClient>,
    assembler: ContextAssembler,
    config: Arc<ChatConfig>,
    user_agent: String,
}

struct TurnJob {
    db: Arc<ChatDatabase>,
    client: Arc<dyn CompletionClient>,
    config: Arc<ChatConfig>,
    conversation_id: String,
    session_id: Option<String>,
    session_data: serde_json::Value,
    message: String,
    request: CompletionRequest,
}

impl ChatAgent {
    pub fn new(db: Arc<ChatDatabase>, client: Arc<dyn CompletionClient>, config: ChatConfig) -> Self {
        let assembler = ContextAssembler::new(db.clone(), config.memory_scope);
        Self {
            db,
            client,
            assembler,
            config: Arc::new(config),
            user_agent: "memochat".to_string(),
        }
    }

    /// Label stored in session rows.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn database(&self) -> &Arc<ChatDatabase> {
        &self.db
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn ensure_conversation(&self, session: &mut ChatSession, message: &str) -> Result<String> {
        if let Some(id) = &session.conversation_id {
            return Ok(id.clone());
        }
        let conversation = self
            .db
            .create_conversation(Some(&title_from_message(message)))?;
        tracing::info!(
            "Started conversation {} ({})",
            conversation.id,
            conversation.title
        );
        session.conversation_id = Some(conversation.id.clone());
        Ok(conversation.id)
    }

    fn ensure_session_row(&self, session: &mut ChatSession, conversation_id: &str, message: &str) {
        if session.session_id.is_some() {
            return;
        }
        let data = json!({
            "user_agent": self.user_agent,
            "initial_message": preview(message, SESSION_PREVIEW_CHARS),
        });
        match self.db.create_session(conversation_id, &data) {
            Ok(row) => session.session_id = Some(row.id),
            Err(e) => tracing::warn!("Failed to record session for {}: {}", conversation_id, e),
        }
    }

    /// Answer `message` within `session`. Must be called inside a Tokio runtime.
    ///
    /// The user message is stored before the request goes out; the reply is
    /// stored only once the completion stream has ended.
    pub fn respond(&self, session: &mut ChatSession, message: &str, prior_turns: &[Turn]) -> ReplyStream {
        let conversation_id = match self.ensure_conversation(session, message) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to create conversation: {}", e);
                return ReplyStream::failed(None, e.to_string());
            }
        };
        self.ensure_session_row(session, &conversation_id, message);

        if let Err(e) = analyze_user_pattern(&self.db, &conversation_id, message) {
            tracing::warn!("Pattern analysis skipped for {}: {}", conversation_id, e);
        }

        if let Err(e) = self
            .db
            .add_message(&conversation_id, MessageRole::User, message)
        {
            tracing::error!("Failed to store user message in {}: {}", conversation_id, e);
            return ReplyStream::failed(Some(conversation_id), e.to_string());
        }
        session.turns += 1;

        let messages = self
            .assembler
            .enrich(&conversation_id, build_messages(prior_turns, message));
        let request = CompletionRequest::from_config(&self.config, messages, true);

        let job = TurnJob {
            db: self.db.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            conversation_id: conversation_id.clone(),
            session_id: session.session_id.clone(),
            session_data: json!({
                "user_agent": self.user_agent,
                "turns": session.turns,
                "last_message": preview(message, SESSION_PREVIEW_CHARS),
            }),
            message: message.to_string(),
            request,
        };

        let (tx, rx) = flume::unbounded();
        tokio::spawn(job.run(tx));
        ReplyStream::from_receiver(Some(conversation_id), rx)
    }
}

impl TurnJob {
    async fn run(self, tx: flume::Sender<ChatEvent>) {
        let started = Instant::now();
        let mut fragments = match self.client.stream(&self.request).await {
            Ok(fragments) => fragments,
            Err(e) => {
                tracing::error!("Completion request failed for {}: {}", self.conversation_id, e);
                let _ = tx.send(ChatEvent::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        let mut reply = String::new();
        let mut fragment_count = 0usize;
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    reply.push_str(&text);
                    fragment_count += 1;
                    let partial = ChatEvent::Partial {
                        content: reply.clone(),
                    };
                    if tx.send(partial).is_err() {
                        tracing::debug!("Reply for {} cancelled by caller", self.conversation_id);
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Completion stream failed for {}: {}", self.conversation_id, e);
                    let _ = tx.send(ChatEvent::Error {
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }

        if tx.is_disconnected() {
            tracing::debug!("Reply for {} cancelled by caller", self.conversation_id);
            return;
        }

        if let Err(e) = self
            .db
            .add_message(&self.conversation_id, MessageRole::Assistant, &reply)
        {
            tracing::error!(
                "Failed to store assistant reply in {}: {}",
                self.conversation_id,
                e
            );
            let _ = tx.send(ChatEvent::Error {
                message: e.to_string(),
            });
            return;
        }

        self.record_follow_up(&reply, fragment_count, started);
        let _ = tx.send(ChatEvent::Done {
            conversation_id: self.conversation_id.clone(),
            content: reply,
        });
    }

    /// Derived records after a stored reply. Failures are logged only.
    fn record_follow_up(&self, reply: &str, fragment_count: usize, started: Instant) {
        let conversation_id = self.conversation_id.as_str();
        let reply_chars = reply.chars().count();

        if reply_chars > SUBSTANTIAL_REPLY_CHARS {
            let note = format!(
                "User: {}... | Response: {} chars",
                preview(&self.message, INTERACTION_PREVIEW_CHARS),
                reply_chars
            );
            if let Err(e) = self.db.store_memory(
                Some(conversation_id),
                &MemoryKind::SuccessfulInteractions,
                &note,
                2,
            ) {
                tracing::warn!("Failed to record interaction for {}: {}", conversation_id, e);
            }
        }

        let metrics = ResponseMetrics {
            response_chars: reply_chars,
            fragment_count,
            duration_ms: started.elapsed().as_millis() as u64,
            model: self.request.model.clone(),
        };
        if let Err(e) = self.db.record_response_metrics(conversation_id, &metrics) {
            tracing::warn!("Failed to record metrics for {}: {}", conversation_id, e);
        }

        match self
            .db
            .summarize_conversation(conversation_id, self.config.summary_threshold_messages)
        {
            Ok(Some(_)) => tracing::debug!("Conversation {} summarized", conversation_id),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to summarize {}: {}", conversation_id, e),
        }

        if let Some(session_id) = &self.session_id {
            if let Err(e) = self.db.update_session(session_id, &self.session_data) {
                tracing::warn!("Failed to update session {}: {}", session_id, e);
            }
        }
    }
}
