use anyhow::{Context, Result};
use std::time::Duration;

/// Opt in to system proxy discovery with `MEMOCHAT_ENABLE_SYSTEM_PROXY=1`.
/// Discovery can panic on some platforms, so the default client skips it.
fn system_proxy_enabled() -> bool {
    std::env::var("MEMOCHAT_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn build_http_client() -> Result<reqwest::Client> {
    build_http_client_with_timeout(None)
}

pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    if system_proxy_enabled() {
        match std::panic::catch_unwind(|| attempt_build(timeout, false)) {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(error)) => tracing::warn!(
                "HTTP client with system proxy failed ({}); retrying with no_proxy",
                error
            ),
            Err(_) => tracing::warn!(
                "HTTP client system proxy discovery panicked; retrying with no_proxy"
            ),
        }
    }

    attempt_build(timeout, true).context("Failed to initialize HTTP client")
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
