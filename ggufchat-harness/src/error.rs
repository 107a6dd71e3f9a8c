//! Error types for chat sessions.

use ggufchat_llm::LlmError;
use thiserror::Error;

/// Errors that can occur in the chat layer.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Generation error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A generation call is already running on this engine.
    #[error("Generation already in progress")]
    Busy,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for chat-layer operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
