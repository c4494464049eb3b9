//! Tools the model (or an API caller) can invoke against the chat store.
//!
//! Each tool declares a JSON Schema for its parameters so the registry can
//! hand out OpenAI-format function definitions. Parameters are checked by
//! [`safety::validate_input`] before any tool runs.

pub mod database;
pub mod safety;
pub mod sql;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use database::register_database_tools;
pub use safety::{validate_input, validate_query, SqlVerdict};
pub use sql::SqlTools;

/// The result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolOutput {
    Text(String),
    Json(serde_json::Value),
    Error(String),
}

impl ToolOutput {
    /// Render for feeding back to a model.
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ToolOutput::Error(_))
    }
}

/// Per-call context.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Conversation the call is made on behalf of, if any.
    pub conversation_id: Option<String>,
}

impl ToolContext {
    pub fn for_conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g. "sql_query")
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// OpenAI-format function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub output: ToolOutput,
}

impl ToolCallResult {
    fn error(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            output: ToolOutput::Error(message),
        }
    }
}

/// Name-keyed tool set. Definitions come out in name order.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!("Registered tool: {}", name);
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Validate parameters, then run the named tool. Failures become
    /// [`ToolOutput::Error`] rather than an `Err`.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let Some(tool) = self.get(&call.name).await else {
            return ToolCallResult::error(&call.name, format!("Unknown tool: {}", call.name));
        };

        if let SqlVerdict::Block(reason) = validate_input(&call.arguments) {
            tracing::warn!("Blocked parameters for tool '{}': {}", call.name, reason);
            return ToolCallResult::error(&call.name, reason);
        }

        tracing::debug!("Executing tool '{}'", call.name);
        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => ToolCallResult {
                name: call.name.clone(),
                output,
            },
            Err(e) => ToolCallResult::error(&call.name, format!("Tool execution failed: {}", e)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the input message"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            })
        }

        async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
            match params["message"].as_str() {
                Some("fail") => anyhow::bail!("asked to fail"),
                Some(message) => Ok(ToolOutput::Text(format!(
                    "{}@{}",
                    message,
                    ctx.conversation_id.as_deref().unwrap_or("-")
                ))),
                None => Ok(ToolOutput::Error("missing message".to_string())),
            }
        }
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn registered_tools_are_listed_and_described() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        assert_eq!(registry.list_names().await, vec!["echo"]);

        let defs = registry.tool_definitions().await;
        assert_eq!(defs[0].tool_type, "function");
        assert_eq!(defs[0].function.parameters["required"], json!(["message"]));
    }

    #[tokio::test]
    async fn calls_run_with_context() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let result = registry
            .execute_call(
                &call("echo", json!({"message": "hi"})),
                &ToolContext::for_conversation("c1"),
            )
            .await;
        assert_eq!(result.output.to_llm_string(), "hi@c1");
    }

    #[tokio::test]
    async fn failures_become_error_outputs() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let ctx = ToolContext::default();

        let unknown = registry.execute_call(&call("nope", json!({})), &ctx).await;
        assert!(!unknown.output.is_success());

        let failed = registry
            .execute_call(&call("echo", json!({"message": "fail"})), &ctx)
            .await;
        assert!(failed.output.to_llm_string().contains("asked to fail"));

        let mut nested = json!("leaf");
        for _ in 0..12 {
            nested = json!({ "message": nested });
        }
        let blocked = registry.execute_call(&call("echo", nested), &ctx).await;
        assert!(blocked.output.to_llm_string().contains("nesting depth"));
    }
}
