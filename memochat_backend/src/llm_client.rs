//! Client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Streaming responses arrive as server-sent events; each `data:` line
//! carries one JSON chunk whose `choices[0].delta.content` is the next text
//! fragment, and `data: [DONE]` ends the stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::ChatConfig;
use crate::http_client::build_http_client_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stream: bool,
}

impl CompletionRequest {
    /// Request with the sampling settings from `config`.
    pub fn from_config(config: &ChatConfig, messages: Vec<ChatMessage>, stream: bool) -> Self {
        Self {
            messages,
            model: config.llm_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            stream,
        }
    }
}

/// Ordered text fragments of one streamed completion.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Result<Self> {
        Self::with_client(api_url, api_key, model, build_http_client_with_timeout(None)?)
    }

    pub fn with_client(
        api_url: String,
        api_key: Option<String>,
        model: String,
        client: reqwest::Client,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            client,
        })
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let client =
            build_http_client_with_timeout(config.llm_timeout_secs.map(Duration::from_secs))?;
        Self::with_client(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            client,
        )
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(request);
        // Local servers (Ollama, vLLM) run without a key.
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send completion request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Completion API returned error {}: {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut request = request.clone();
        request.stream = false;
        let completion: ChatCompletionResponse = self
            .send(&request)
            .await?
            .json()
            .await
            .context("Failed to parse completion response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from completion API"))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let mut request = request.clone();
        request.stream = true;
        let response = self.send(&request).await?;
        tracing::debug!("Streaming completion from {}", request.model);
        Ok(sse_fragments(response))
    }
}

/// Incremental splitter for an SSE byte stream.
///
/// Bytes are buffered until a full line arrives, so a UTF-8 sequence split
/// across network chunks is decoded whole.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    line_buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes and return the fragments completed by them.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.line_buffer.extend_from_slice(chunk);
        let mut fragments = Vec::new();

        while let Some(newline_idx) = self.line_buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.line_buffer.drain(..=newline_idx).collect();
            if self.done {
                continue;
            }
            let line = decode_line(&raw[..newline_idx])?;
            if let Some(fragment) = self.parse_line(line.trim())? {
                fragments.push(fragment);
            }
        }
        Ok(fragments)
    }

    /// Flush a final line that arrived without a trailing newline.
    pub(crate) fn finish(&mut self) -> Result<Option<String>> {
        let raw = std::mem::take(&mut self.line_buffer);
        if self.done {
            return Ok(None);
        }
        let line = decode_line(&raw)?;
        self.parse_line(line.trim())
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<String>> {
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let chunk: serde_json::Value = serde_json::from_str(payload)
            .with_context(|| format!("Failed to parse stream payload: {}", payload))?;
        if let Some(message) = chunk.get("error") {
            anyhow::bail!("Completion stream reported an error: {}", message);
        }
        Ok(chunk["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["delta"]["content"].as_str())
            .filter(|content| !content.is_empty())
            .map(str::to_string))
    }
}

fn decode_line(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).context("Completion stream sent invalid UTF-8")
}

struct SseState {
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
}

fn sse_fragments(response: reqwest::Response) -> FragmentStream {
    let state = SseState {
        response: Some(response),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            let response = state.response.as_mut()?;
            if state.decoder.is_done() {
                state.response = None;
                continue;
            }

            let next = response.chunk().await;
            match next {
                Ok(Some(bytes)) => match state.decoder.push(&bytes) {
                    Ok(fragments) => state.pending.extend(fragments),
                    Err(error) => {
                        state.response = None;
                        return Some((Err(error), state));
                    }
                },
                Ok(None) => {
                    state.response = None;
                    match state.decoder.finish() {
                        Ok(fragment) => state.pending.extend(fragment),
                        Err(error) => return Some((Err(error), state)),
                    }
                }
                Err(error) => {
                    state.response = None;
                    return Some((
                        Err(anyhow::Error::new(error).context("Failed reading streaming chunk")),
                        state,
                    ));
                }
            }
        }
    })
    .boxed()
}
