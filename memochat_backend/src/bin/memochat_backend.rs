use anyhow::{Context, Result};
use memochat_backend::config::ChatConfig;
use memochat_backend::runtime::ChatRuntime;
use memochat_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,memochat_backend=debug")),
        )
        .init();

    let config = ChatConfig::load();
    config
        .validate()
        .context("refusing to start with an invalid configuration")?;

    tracing::info!(
        "Starting memochat backend (database: {}, bind: {}; override with MEMOCHAT_DB_PATH / MEMOCHAT_BIND)",
        config.database_path,
        config.bind_addr
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = ChatRuntime::bootstrap(config)
            .await
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime).await
    })
}
