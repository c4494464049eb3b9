//! Function-calling wrappers around [`SqlTools`].
//!
//! - `sql_query`: run one validated statement with positional parameters.
//! - `database_schema`: list tables, columns and row counts.
//! - `natural_language_query`: map a plain request onto a canned query.
//! - `conversation_insights`: message, activity, task and memory aggregates.
//! - `database_request`: free-form request answered as text.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::sql::{SqlOutcome, SqlTools, TranslationError, NL_SUGGESTION};
use super::{Tool, ToolContext, ToolOutput, ToolRegistry};
use crate::database::ChatDatabase;

fn required_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn missing(key: &str) -> ToolOutput {
    ToolOutput::Error(format!("Missing required '{}' parameter", key))
}

pub struct SqlQueryTool {
    sql: SqlTools,
}

impl SqlQueryTool {
    pub fn new(sql: SqlTools) -> Self {
        Self { sql }
    }
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn name(&self) -> &str {
        "sql_query"
    }

    fn description(&self) -> &str {
        "Run one SQL statement against the chat database. SELECT/WITH/INSERT are allowed; UPDATE and DELETE need a WHERE clause; schema changes are rejected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A single SQL statement, using ?1, ?2 ... for parameters"
                },
                "params": {
                    "type": "array",
                    "description": "Positional parameter values",
                    "items": {}
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(query) = required_str(&params, "query") else {
            return Ok(missing("query"));
        };
        let bound = params
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(match self.sql.execute_sql(query, &bound)? {
            SqlOutcome::Rejected { reason } => ToolOutput::Error(format!("Query rejected: {}", reason)),
            outcome => ToolOutput::Json(serde_json::to_value(outcome)?),
        })
    }
}

pub struct SchemaTool {
    sql: SqlTools,
}

impl SchemaTool {
    pub fn new(sql: SqlTools) -> Self {
        Self { sql }
    }
}

#[async_trait]
impl Tool for SchemaTool {
    fn name(&self) -> &str {
        "database_schema"
    }

    fn description(&self) -> &str {
        "Describe the chat database: tables, columns and row counts."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        Ok(ToolOutput::Json(serde_json::to_value(
            self.sql.get_schema_info()?,
        )?))
    }
}

pub struct NaturalLanguageQueryTool {
    sql: SqlTools,
}

impl NaturalLanguageQueryTool {
    pub fn new(sql: SqlTools) -> Self {
        Self { sql }
    }
}

#[async_trait]
impl Tool for NaturalLanguageQueryTool {
    fn name(&self) -> &str {
        "natural_language_query"
    }

    fn description(&self) -> &str {
        "Answer a plain-language question about stored conversations, tasks, memories or preferences."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "request": {
                    "type": "string",
                    "description": "e.g. 'show recent conversations' or 'search for \"lifetimes\"'"
                }
            },
            "required": ["request"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(request) = required_str(&params, "request") else {
            return Ok(missing("request"));
        };

        match self.sql.execute_natural_language_query(request) {
            Ok(result) => Ok(ToolOutput::Json(serde_json::to_value(result)?)),
            Err(e) => match e.downcast_ref::<TranslationError>() {
                Some(reason) => Ok(ToolOutput::Error(format!("{}. {}", reason, NL_SUGGESTION))),
                None => Err(e),
            },
        }
    }
}

pub struct InsightsTool {
    sql: SqlTools,
}

impl InsightsTool {
    pub fn new(sql: SqlTools) -> Self {
        Self { sql }
    }
}

#[async_trait]
impl Tool for InsightsTool {
    fn name(&self) -> &str {
        "conversation_insights"
    }

    fn description(&self) -> &str {
        "Aggregate statistics: messages per role, daily activity, task completion and memory distribution."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "conversation_id": {
                    "type": "string",
                    "description": "Restrict message statistics to one conversation. Defaults to the current one; pass \"all\" for every conversation."
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let conversation_id = match required_str(&params, "conversation_id") {
            Some("all") => None,
            Some(id) => Some(id),
            None => ctx.conversation_id.as_deref(),
        };
        Ok(ToolOutput::Json(serde_json::to_value(
            self.sql.get_conversation_insights(conversation_id)?,
        )?))
    }
}

pub struct DatabaseRequestTool {
    sql: SqlTools,
}

impl DatabaseRequestTool {
    pub fn new(sql: SqlTools) -> Self {
        Self { sql }
    }
}

#[async_trait]
impl Tool for DatabaseRequestTool {
    fn name(&self) -> &str {
        "database_request"
    }

    fn description(&self) -> &str {
        "Free-form database request (schema, insights, ```sql blocks to run, or plain questions), answered as text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "request": { "type": "string" }
            },
            "required": ["request"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(request) = required_str(&params, "request") else {
            return Ok(missing("request"));
        };
        Ok(ToolOutput::Text(self.sql.process_database_request(request)))
    }
}

/// Register every database tool against `db`.
pub async fn register_database_tools(registry: &ToolRegistry, db: Arc<ChatDatabase>) {
    let sql = SqlTools::new(db);
    registry.register(Arc::new(SqlQueryTool::new(sql.clone()))).await;
    registry.register(Arc::new(SchemaTool::new(sql.clone()))).await;
    registry
        .register(Arc::new(NaturalLanguageQueryTool::new(sql.clone())))
        .await;
    registry.register(Arc::new(InsightsTool::new(sql.clone()))).await;
    registry.register(Arc::new(DatabaseRequestTool::new(sql))).await;
}
