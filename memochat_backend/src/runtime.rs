use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::agent::ChatAgent;
use crate::config::ChatConfig;
use crate::database::ChatDatabase;
use crate::llm_client::{CompletionClient, LlmClient};
use crate::tools::{register_database_tools, SqlTools, ToolRegistry};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything the server needs, wired once at startup.
pub struct ChatRuntime {
    pub config: ChatConfig,
    pub db: Arc<ChatDatabase>,
    pub agent: Arc<ChatAgent>,
    pub sql: SqlTools,
    pub tool_registry: Arc<ToolRegistry>,
}

pub struct ChatRuntimeBuilder {
    config: ChatConfig,
    client: Option<Arc<dyn CompletionClient>>,
    db: Option<Arc<ChatDatabase>>,
}

impl ChatRuntimeBuilder {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            client: None,
            db: None,
        }
    }

    /// Use `client` instead of an HTTP client built from the config.
    pub fn with_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use an already-open store instead of opening `database_path`.
    pub fn with_database(mut self, db: Arc<ChatDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    pub async fn build(self) -> Result<ChatRuntime> {
        let config = self.config;

        let db = match self.db {
            Some(db) => db,
            None => Arc::new(ChatDatabase::new(&config.database_path).with_context(|| {
                format!("Failed to open chat database at '{}'", config.database_path)
            })?),
        };

        let client: Arc<dyn CompletionClient> = match self.client {
            Some(client) => client,
            None => Arc::new(
                LlmClient::from_config(&config).context("Failed to build completion client")?,
            ),
        };
        tracing::info!(
            "Completion client ready (model: {}, memory scope: {:?})",
            client.model(),
            config.memory_scope
        );

        let tool_registry = Arc::new(ToolRegistry::new());
        register_database_tools(&tool_registry, db.clone()).await;
        tracing::info!(
            "Tool registry initialized with {} tools",
            tool_registry.list_names().await.len()
        );

        let agent = Arc::new(
            ChatAgent::new(db.clone(), client, config.clone())
                .with_user_agent(format!("memochat_backend/{}", env!("CARGO_PKG_VERSION"))),
        );

        Ok(ChatRuntime {
            sql: SqlTools::new(db.clone()),
            config,
            db,
            agent,
            tool_registry,
        })
    }
}

impl ChatRuntime {
    pub async fn bootstrap(config: ChatConfig) -> Result<Self> {
        ChatRuntimeBuilder::new(config).build().await
    }

    /// Run the retention sweep now and then once a day. Only when
    /// `retention_sweep` is set and `retention_days` is non-zero.
    pub fn spawn_retention_sweep(&self) -> Option<JoinHandle<()>> {
        let days = self.config.retention_days;
        if !self.config.retention_sweep || days == 0 {
            tracing::info!("Retention sweep disabled");
            return None;
        }
        let db = self.db.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = db.cleanup_old_states(days) {
                    tracing::error!("Retention sweep failed: {}", e);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{CompletionRequest, FragmentStream};
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};

    struct SilentClient;

    #[async_trait]
    impl CompletionClient for SilentClient {
        fn model(&self) -> &str {
            "silent"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            Ok(String::new())
        }

        async fn stream(&self, _request: &CompletionRequest) -> Result<FragmentStream> {
            Ok(stream::empty().boxed())
        }
    }

    #[tokio::test]
    async fn builder_opens_the_configured_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ChatConfig::default();
        config.database_path = dir
            .path()
            .join("nested")
            .join("chat.db")
            .to_string_lossy()
            .into_owned();

        let runtime = ChatRuntimeBuilder::new(config)
            .with_client(Arc::new(SilentClient))
            .build()
            .await
            .expect("runtime");
        assert!(dir.path().join("nested").join("chat.db").exists());
        assert_eq!(runtime.tool_registry.list_names().await.len(), 5);
        assert!(runtime.db.list_conversations().expect("list").is_empty());
    }

    async fn runtime_with(config: ChatConfig) -> ChatRuntime {
        ChatRuntimeBuilder::new(config)
            .with_client(Arc::new(SilentClient))
            .with_database(Arc::new(ChatDatabase::open_in_memory().expect("db")))
            .build()
            .await
            .expect("runtime")
    }

    #[tokio::test]
    async fn retention_sweep_is_off_by_default() {
        let runtime = runtime_with(ChatConfig::default()).await;
        assert!(runtime.spawn_retention_sweep().is_none());
    }

    #[tokio::test]
    async fn retention_sweep_needs_a_window() {
        let mut config = ChatConfig::default();
        config.retention_sweep = true;
        config.retention_days = 0;
        assert!(runtime_with(config).await.spawn_retention_sweep().is_none());

        let mut config = ChatConfig::default();
        config.retention_sweep = true;
        let handle = runtime_with(config)
            .await
            .spawn_retention_sweep()
            .expect("sweep task");
        handle.abort();
    }
}
