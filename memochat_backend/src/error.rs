//! Typed errors that callers branch on.
//!
//! Everything else travels as `anyhow::Error`; these are attached to it and
//! recovered with `downcast_ref` where a caller needs to tell them apart
//! (the HTTP layer maps the not-found cases to 404).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation '{0}' not found")]
    ConversationNotFound(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("database lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("retention of {0} days reaches past the representable date range")]
    RetentionOutOfRange(u32),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ConversationNotFound(_)
                | StoreError::TaskNotFound(_)
                | StoreError::SessionNotFound(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no completion API key configured (set LLM_API_KEY or CEREBRAS_API_KEY, or llm_api_key in the config file)")]
    MissingApiKey,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// True when `error` carries a [`StoreError`] caused by the caller's arguments.
pub fn is_invalid_argument(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<StoreError>(),
        Some(StoreError::RetentionOutOfRange(_))
    )
}

/// True when `error` carries a [`StoreError`] for a missing row.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<StoreError>()
        .map(StoreError::is_not_found)
        .unwrap_or(false)
}
