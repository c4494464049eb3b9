use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Which memories the context assembler reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// One pool shared by every conversation.
    #[default]
    Global,
    /// Only memories recorded against the conversation being answered.
    Conversation,
}

impl MemoryScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "global" | "shared" => Some(MemoryScope::Global),
            "conversation" | "scoped" => Some(MemoryScope::Conversation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    // Completion API (OpenAI-compatible: Cerebras, OpenAI, vLLM, Ollama, ...)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Transport timeout for completion requests; unset means none.
    #[serde(default)]
    pub llm_timeout_secs: Option<u64>,

    // Store
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub memory_scope: MemoryScope,
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold_messages: usize,
    /// Window used by `POST /v1/maintenance/cleanup` when no `days` is given.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Also run the cleanup at startup and then daily.
    #[serde(default)]
    pub retention_sweep: bool,

    // HTTP surface
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_llm_url() -> String {
    "https://api.cerebras.ai/v1".to_string()
}

fn default_llm_model() -> String {
    "qwen-3-coder-480b".to_string()
}

fn default_max_tokens() -> u32 {
    40_000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.8
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("memochat").join("memochat.db"))
        .unwrap_or_else(|| PathBuf::from("memochat.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_summary_threshold() -> usize {
    50
}

fn default_retention_days() -> u32 {
    30
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            llm_timeout_secs: None,
            database_path: default_database_path(),
            memory_scope: MemoryScope::default(),
            summary_threshold_messages: default_summary_threshold(),
            retention_days: default_retention_days(),
            retention_sweep: false,
            bind_addr: default_bind_addr(),
        }
    }
}

impl ChatConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `MEMOCHAT_CONFIG` if set, otherwise `memochat_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("MEMOCHAT_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("memochat_config.toml"),
        }
    }

    /// Load `.env`, then the config file (or defaults), then environment overrides.
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }

        let path = Self::config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<ChatConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(model) = non_empty("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = non_empty("LLM_API_KEY").or_else(|| non_empty("CEREBRAS_API_KEY")) {
            self.llm_api_key = Some(key.trim().to_string());
        }

        if let Some(tokens) = non_empty("LLM_MAX_TOKENS") {
            if let Ok(tokens) = tokens.trim().parse() {
                self.max_tokens = tokens;
            }
        }

        if let Some(path) = non_empty("MEMOCHAT_DB_PATH") {
            self.database_path = path;
        }

        if let Some(scope) = non_empty("MEMOCHAT_MEMORY_SCOPE") {
            match MemoryScope::parse(&scope) {
                Some(scope) => self.memory_scope = scope,
                None => tracing::warn!("Ignoring unknown MEMOCHAT_MEMORY_SCOPE '{}'", scope),
            }
        }

        if let Some(days) = non_empty("MEMOCHAT_RETENTION_DAYS") {
            if let Ok(days) = days.trim().parse() {
                self.retention_days = days;
            }
        }

        if let Some(sweep) = non_empty("MEMOCHAT_RETENTION_SWEEP") {
            match sweep.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.retention_sweep = true,
                "0" | "false" | "no" | "off" => self.retention_sweep = false,
                other => tracing::warn!("Ignoring unknown MEMOCHAT_RETENTION_SWEEP '{}'", other),
            }
        }

        if let Some(bind) = non_empty("MEMOCHAT_BIND") {
            self.bind_addr = bind;
        }
    }

    /// Startup check: the chat surface refuses to run without a credential.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_key = self
            .llm_api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false);
        if !has_key {
            return Err(ConfigError::MissingApiKey);
        }
        if self.llm_api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("llm_api_url is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ConfigError::Invalid(format!(
                "top_p must be within 0.0..=1.0 (got {})",
                self.top_p
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_completion_parameters() {
        let config = ChatConfig::default();
        assert_eq!(config.llm_model, "qwen-3-coder-480b");
        assert_eq!(config.max_tokens, 40_000);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert!((config.top_p - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.memory_scope, MemoryScope::Global);
        assert_eq!(config.retention_days, 30);
        assert!(!config.retention_sweep);
    }

    #[test]
    fn missing_api_key_fails_validation() {
        let config = ChatConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiKey)));

        let mut config = ChatConfig::default();
        config.llm_api_key = Some("   ".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn cerebras_key_is_accepted_as_fallback() {
        let mut config = ChatConfig::default();
        config.apply_overrides(lookup_from(&[("CEREBRAS_API_KEY", "csk-123")]));
        assert_eq!(config.llm_api_key.as_deref(), Some("csk-123"));
        assert!(config.validate().is_ok());

        let mut config = ChatConfig::default();
        config.apply_overrides(lookup_from(&[
            ("CEREBRAS_API_KEY", "csk-123"),
            ("LLM_API_KEY", "sk-primary"),
        ]));
        assert_eq!(config.llm_api_key.as_deref(), Some("sk-primary"));
    }

    #[test]
    fn overrides_parse_scope_and_ignore_garbage() {
        let mut config = ChatConfig::default();
        config.apply_overrides(lookup_from(&[
            ("MEMOCHAT_MEMORY_SCOPE", "conversation"),
            ("MEMOCHAT_RETENTION_DAYS", "not-a-number"),
            ("MEMOCHAT_DB_PATH", "/tmp/chat.db"),
        ]));
        assert_eq!(config.memory_scope, MemoryScope::Conversation);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.database_path, "/tmp/chat.db");

        config.apply_overrides(lookup_from(&[("MEMOCHAT_RETENTION_SWEEP", "on")]));
        assert!(config.retention_sweep);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ChatConfig = toml::from_str(
            r#"
            llm_model = "llama-3.3-70b"
            memory_scope = "conversation"
            "#,
        )
        .expect("parse config");
        assert_eq!(config.llm_model, "llama-3.3-70b");
        assert_eq!(config.memory_scope, MemoryScope::Conversation);
        assert_eq!(config.llm_api_url, "https://api.cerebras.ai/v1");
        assert_eq!(config.summary_threshold_messages, 50);
    }
}
