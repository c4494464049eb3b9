use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{ChatAgent, ChatSession, ContextSnapshot};
use crate::database::{
    AgentStats, ChatDatabase, CleanupReport, Conversation, Memory, Message, Session, StateRecord,
    Task, TaskStatus, Turn,
};
use crate::error::{is_invalid_argument, is_not_found};
use crate::payload::{CurrentTaskState, MemoryKind, PreferenceMap, StateKind, StatePayload};
use crate::runtime::ChatRuntime;
use crate::tools::sql::{
    ConversationInsights, NaturalLanguageResult, SchemaInfo, SqlOutcome, TranslationError,
};
use crate::tools::{SqlTools, ToolCall, ToolCallResult, ToolContext, ToolDef, ToolRegistry};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<ChatAgent>,
    pub db: Arc<ChatDatabase>,
    pub sql: SqlTools,
    pub tools: Arc<ToolRegistry>,
    pub retention_days: u32,
}

impl ServerState {
    pub fn from_runtime(runtime: &ChatRuntime) -> Arc<Self> {
        Arc::new(Self {
            agent: runtime.agent.clone(),
            db: runtime.db.clone(),
            sql: runtime.sql.clone(),
            tools: runtime.tool_registry.clone(),
            retention_days: runtime.config.retention_days,
        })
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    memory_type: String,
    conversation_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct InsightsQuery {
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatSocketQuery {
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameConversationRequest {
    title: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    task_name: String,
    description: Option<String>,
    #[serde(default = "default_task_priority")]
    priority: i64,
}

fn default_task_priority() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
struct TaskStatusRequest {
    status: TaskStatus,
}

#[derive(Debug, Deserialize)]
struct StoreMemoryRequest {
    conversation_id: Option<String>,
    memory_type: MemoryKind,
    content: String,
    #[serde(default = "default_memory_importance")]
    importance: i64,
    /// Skip when the same content is already stored under this type.
    #[serde(default)]
    unique: bool,
}

fn default_memory_importance() -> i64 {
    1
}

#[derive(Debug, Serialize)]
struct StoreMemoryResponse {
    id: Option<i64>,
    stored: bool,
}

#[derive(Debug, Deserialize)]
struct PromoteRequest {
    pattern: String,
}

#[derive(Debug, Serialize)]
struct PromoteResponse {
    promoted: usize,
}

#[derive(Debug, Serialize)]
struct ContextPreview {
    snapshot: ContextSnapshot,
    rendered: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CleanupRequest {
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SqlQueryRequest {
    query: String,
    #[serde(default)]
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct NaturalLanguageRequest {
    request: String,
}

#[derive(Debug, Serialize)]
struct DatabaseRequestResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
    conversation_id: Option<String>,
}

/// Frames a chat socket accepts.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message {
        content: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    Cancel,
}

/// Frames a chat socket sends besides the reply events themselves.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Started { conversation_id: String },
    Cancelled,
    Error { message: String },
}

pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/search", get(search_conversations))
        .route(
            "/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/conversations/:id/title", put(rename_conversation))
        .route("/conversations/:id/messages", get(list_messages))
        .route("/conversations/:id/turns", get(list_turns))
        .route(
            "/conversations/:id/tasks",
            get(list_tasks).post(create_task),
        )
        .route(
            "/conversations/:id/preferences",
            get(get_preferences).put(put_preferences),
        )
        .route("/conversations/:id/focus", put(set_focus))
        .route("/conversations/:id/state/:kind", get(state_history))
        .route("/conversations/:id/context", get(context_preview))
        .route("/conversations/:id/session", get(latest_session))
        .route(
            "/conversations/:id/memories/promote",
            post(promote_memories),
        )
        .route("/tasks/:id/status", put(update_task_status))
        .route("/memories", get(retrieve_memories).post(store_memory))
        .route("/stats", get(get_stats))
        .route("/maintenance/cleanup", post(cleanup))
        .route("/sql/query", post(sql_query))
        .route("/sql/schema", get(sql_schema))
        .route("/sql/natural", post(sql_natural))
        .route("/sql/insights", get(sql_insights))
        .route("/sql/request", post(sql_request))
        .route("/tools", get(list_tools))
        .route("/tools/call", post(call_tool))
        .route("/ws/chat", get(ws_chat_route))
        .with_state(state);

    Router::new().nest("/v1", api)
}

pub async fn serve_backend(runtime: ChatRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| {
            format!(
                "Invalid bind address '{}' (expected host:port)",
                runtime.config.bind_addr
            )
        })?;

    runtime.spawn_retention_sweep();
    let app = router(ServerState::from_runtime(&runtime));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("memochat backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.agent.config().llm_model.clone(),
    })
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Conversation>> {
    let limit = query.limit.map(|limit| limit.clamp(1, 1000));
    state
        .db
        .list_recent_conversations(limit)
        .map(Json)
        .map_err(api_error)
}

async fn create_conversation(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateConversationRequest>,
) -> ApiResult<Conversation> {
    state
        .db
        .create_conversation(body.title.as_deref())
        .map(Json)
        .map_err(api_error)
}

async fn search_conversations(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Vec<Conversation>> {
    state
        .db
        .search_conversations(&query.q)
        .map(Json)
        .map_err(api_error)
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Conversation> {
    require_conversation(&state, &conversation_id).map(Json)
}

async fn delete_conversation(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<DeleteResponse> {
    let deleted = state
        .db
        .delete_conversation(&conversation_id)
        .map_err(api_error)?;
    if !deleted {
        return Err(conversation_not_found(&conversation_id));
    }
    Ok(Json(DeleteResponse { deleted }))
}

async fn rename_conversation(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<RenameConversationRequest>,
) -> ApiResult<Conversation> {
    if body.title.trim().is_empty() {
        return Err(bad_request("title cannot be empty"));
    }
    state
        .db
        .update_conversation_title(&conversation_id, &body.title)
        .map_err(api_error)?;
    require_conversation(&state, &conversation_id).map(Json)
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Vec<Message>> {
    require_conversation(&state, &conversation_id)?;
    state
        .db
        .get_messages(&conversation_id)
        .map(Json)
        .map_err(api_error)
}

async fn list_turns(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Vec<Turn>> {
    require_conversation(&state, &conversation_id)?;
    state
        .db
        .get_conversation_messages(&conversation_id)
        .map(Json)
        .map_err(api_error)
}

async fn list_tasks(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Vec<Task>> {
    require_conversation(&state, &conversation_id)?;
    let tasks = if query.active {
        state.db.get_active_tasks(&conversation_id)
    } else {
        state.db.list_tasks(&conversation_id)
    };
    tasks.map(Json).map_err(api_error)
}

async fn create_task(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<CreateTaskRequest>,
) -> ApiResult<Task> {
    let task_name = body.task_name.trim();
    if task_name.is_empty() {
        return Err(bad_request("task_name cannot be empty"));
    }
    state
        .db
        .create_task(
            &conversation_id,
            task_name,
            body.description.as_deref(),
            body.priority,
        )
        .map(Json)
        .map_err(api_error)
}

async fn update_task_status(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
    Json(body): Json<TaskStatusRequest>,
) -> ApiResult<Task> {
    state
        .db
        .update_task_status(&task_id, &body.status)
        .map_err(api_error)?;
    state
        .db
        .get_task(&task_id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("task '{}' not found", task_id)))
}

async fn get_preferences(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<PreferenceMap> {
    require_conversation(&state, &conversation_id)?;
    state
        .db
        .get_preferences(&conversation_id)
        .map(Json)
        .map_err(api_error)
}

/// Merge the body into the stored preferences; keys not named are kept.
async fn put_preferences(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Json(updates): Json<PreferenceMap>,
) -> ApiResult<PreferenceMap> {
    state
        .db
        .update_preferences(&conversation_id, |preferences| {
            for (key, value) in updates {
                preferences.insert(key, value);
            }
        })
        .map(Json)
        .map_err(api_error)
}

async fn set_focus(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Json(focus): Json<CurrentTaskState>,
) -> ApiResult<CurrentTaskState> {
    if focus.task.trim().is_empty() {
        return Err(bad_request("task cannot be empty"));
    }
    state
        .db
        .store_state(&conversation_id, &StatePayload::CurrentTask(focus.clone()))
        .map_err(api_error)?;
    Ok(Json(focus))
}

async fn state_history(
    State(state): State<Arc<ServerState>>,
    Path((conversation_id, kind)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<StateRecord>> {
    require_conversation(&state, &conversation_id)?;
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    state
        .db
        .state_history(&conversation_id, &StateKind::from_db(&kind), limit)
        .map(Json)
        .map_err(api_error)
}

async fn context_preview(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<ContextPreview> {
    require_conversation(&state, &conversation_id)?;
    let snapshot = state
        .agent
        .assembler()
        .gather(&conversation_id)
        .map_err(api_error)?;
    Ok(Json(ContextPreview {
        rendered: snapshot.render(),
        snapshot,
    }))
}

async fn latest_session(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Option<Session>> {
    require_conversation(&state, &conversation_id)?;
    state
        .db
        .latest_session_for_conversation(&conversation_id)
        .map(Json)
        .map_err(api_error)
}

async fn promote_memories(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<PromoteRequest>,
) -> ApiResult<PromoteResponse> {
    if body.pattern.trim().is_empty() {
        return Err(bad_request("pattern cannot be empty"));
    }
    require_conversation(&state, &conversation_id)?;
    let promoted = state
        .db
        .promote_importance(&conversation_id, &body.pattern)
        .map_err(api_error)?;
    Ok(Json(PromoteResponse { promoted }))
}

async fn retrieve_memories(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MemoryQuery>,
) -> ApiResult<Vec<Memory>> {
    let kind = MemoryKind::from_db(&query.memory_type);
    let limit = query.limit.unwrap_or(10).clamp(1, 200);
    let memories = match query.conversation_id.as_deref() {
        Some(conversation_id) => {
            state
                .db
                .retrieve_memories_for_conversation(conversation_id, &kind, limit)
        }
        None => state.db.retrieve_memories(&kind, limit),
    };
    memories.map(Json).map_err(api_error)
}

async fn store_memory(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<StoreMemoryRequest>,
) -> ApiResult<StoreMemoryResponse> {
    let content = body.content.trim();
    if content.is_empty() {
        return Err(bad_request("content cannot be empty"));
    }
    let conversation_id = body.conversation_id.as_deref();
    let stored = if body.unique {
        state
            .db
            .store_memory_unique(conversation_id, &body.memory_type, content, body.importance)
    } else {
        state
            .db
            .store_memory(conversation_id, &body.memory_type, content, body.importance)
            .map(Some)
    };
    let id = stored.map_err(api_error)?;

    Ok(Json(StoreMemoryResponse {
        stored: id.is_some(),
        id,
    }))
}

async fn get_stats(State(state): State<Arc<ServerState>>) -> ApiResult<AgentStats> {
    state.db.get_agent_stats().map(Json).map_err(api_error)
}

async fn cleanup(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<CleanupRequest>>,
) -> ApiResult<CleanupReport> {
    let days = body
        .and_then(|Json(body)| body.days)
        .unwrap_or(state.retention_days);
    state
        .db
        .cleanup_old_states(days)
        .map(Json)
        .map_err(api_error)
}

async fn sql_query(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SqlQueryRequest>,
) -> ApiResult<SqlOutcome> {
    match state
        .sql
        .execute_sql(&body.query, &body.params)
        .map_err(api_error)?
    {
        SqlOutcome::Rejected { reason } => Err(bad_request(reason)),
        outcome => Ok(Json(outcome)),
    }
}

async fn sql_schema(State(state): State<Arc<ServerState>>) -> ApiResult<SchemaInfo> {
    state.sql.get_schema_info().map(Json).map_err(api_error)
}

async fn sql_natural(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<NaturalLanguageRequest>,
) -> ApiResult<NaturalLanguageResult> {
    state
        .sql
        .execute_natural_language_query(&body.request)
        .map(Json)
        .map_err(api_error)
}

async fn sql_insights(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<InsightsQuery>,
) -> ApiResult<ConversationInsights> {
    state
        .sql
        .get_conversation_insights(query.conversation_id.as_deref())
        .map(Json)
        .map_err(api_error)
}

async fn sql_request(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<NaturalLanguageRequest>,
) -> ApiResult<DatabaseRequestResponse> {
    Ok(Json(DatabaseRequestResponse {
        response: state.sql.process_database_request(&body.request),
    }))
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<ToolDef>> {
    Ok(Json(state.tools.tool_definitions().await))
}

async fn call_tool(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ToolCallRequest>,
) -> ApiResult<ToolCallResult> {
    let ctx = ToolContext {
        conversation_id: body.conversation_id,
    };
    let call = ToolCall {
        name: body.name,
        arguments: body.arguments,
    };
    Ok(Json(state.tools.execute_call(&call, &ctx).await))
}

async fn ws_chat_route(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ChatSocketQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_chat_socket(state, socket, query.conversation_id))
}

async fn handle_chat_socket(
    state: Arc<ServerState>,
    mut socket: WebSocket,
    conversation_id: Option<String>,
) {
    let mut session = match conversation_id {
        Some(id) => ChatSession::resume(id),
        None => ChatSession::new(),
    };

    while let Some(incoming) = socket.next().await {
        let text = match incoming {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let open = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Message {
                content,
                conversation_id,
            }) => {
                if let Some(id) = conversation_id {
                    if session.conversation_id() != Some(id.as_str()) {
                        session = ChatSession::resume(id);
                    }
                }
                stream_turn(&state, &mut socket, &mut session, &content).await
            }
            // Nothing is streaming.
            Ok(ClientFrame::Cancel) => true,
            Err(e) => {
                send_frame(
                    &mut socket,
                    &ServerFrame::Error {
                        message: format!("invalid frame: {}", e),
                    },
                )
                .await
            }
        };
        if !open {
            break;
        }
    }
    tracing::debug!("Chat socket closed");
}

/// Stream one reply over the socket. Returns false once the socket is gone;
/// dropping the reply there cancels the turn.
async fn stream_turn(
    state: &ServerState,
    socket: &mut WebSocket,
    session: &mut ChatSession,
    content: &str,
) -> bool {
    let content = content.trim();
    if content.is_empty() {
        return send_frame(
            socket,
            &ServerFrame::Error {
                message: "content cannot be empty".to_string(),
            },
        )
        .await;
    }

    let prior_turns = match session.conversation_id() {
        Some(id) => state.db.get_conversation_messages(id).unwrap_or_else(|e| {
            tracing::warn!("Failed to load history for {}: {}", id, e);
            Vec::new()
        }),
        None => Vec::new(),
    };

    let reply = state.agent.respond(session, content, &prior_turns);
    if let Some(conversation_id) = reply.conversation_id() {
        let started = ServerFrame::Started {
            conversation_id: conversation_id.to_string(),
        };
        if !send_frame(socket, &started).await {
            return false;
        }
    }

    let mut events = reply.into_events();
    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(event) => {
                        if !send_frame(socket, &event).await {
                            return false;
                        }
                    }
                    None => return true,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if matches!(serde_json::from_str::<ClientFrame>(&text), Ok(ClientFrame::Cancel)) {
                            tracing::info!("Client cancelled the streaming reply");
                            return send_frame(socket, &ServerFrame::Cancelled).await;
                        }
                        let busy = ServerFrame::Error {
                            message: "a reply is already streaming; send a cancel frame first".to_string(),
                        };
                        if !send_frame(socket, &busy).await {
                            return false;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return false,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_frame<T: Serialize>(socket: &mut WebSocket, frame: &T) -> bool {
    let payload = match serde_json::to_string(frame) {
        Ok(serialized) => serialized,
        Err(error) => {
            tracing::warn!("Failed to serialize websocket frame: {}", error);
            return true;
        }
    };
    socket.send(WsMessage::Text(payload)).await.is_ok()
}

fn require_conversation(
    state: &ServerState,
    conversation_id: &str,
) -> Result<Conversation, (StatusCode, String)> {
    state
        .db
        .get_conversation(conversation_id)
        .map_err(api_error)?
        .ok_or_else(|| conversation_not_found(conversation_id))
}

fn conversation_not_found(conversation_id: &str) -> (StatusCode, String) {
    not_found(format!("conversation '{}' not found", conversation_id))
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn api_error(error: anyhow::Error) -> (StatusCode, String) {
    if is_not_found(&error) {
        return not_found(error.to_string());
    }
    if is_invalid_argument(&error) || error.downcast_ref::<TranslationError>().is_some() {
        return bad_request(error.to_string());
    }
    tracing::error!("Request failed: {:#}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
