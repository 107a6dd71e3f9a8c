//! Error types for LLM operations.

use thiserror::Error;

/// Errors that can occur while running a generation call.
///
/// Only failures that happen before the first token is sampled surface as
/// errors. Once generation has begun, decode and detokenize failures end the
/// loop early and the partial text is returned instead (see
/// [`FinishReason`](crate::types::FinishReason)).
#[derive(Debug, Error)]
pub enum LlmError {
    /// The inference context or sampler is missing or unusable.
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// The prompt could not be tokenized, even after resizing the buffer.
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    /// The prompt tokens were rejected by the decode step.
    #[error("Failed to decode prompt: {0}")]
    PromptDecode(String),

    /// A generated token was rejected by the decode step.
    #[error("Failed to decode token {index}: {reason}")]
    TokenDecode {
        /// Zero-based index of the sampled token within this call.
        index: usize,
        /// Reason reported by the inference context.
        reason: String,
    },

    /// A token rendered to more bytes than the piece buffer could ever hold.
    #[error("Token {token} renders to {required} bytes, exceeding the piece buffer")]
    FragmentTooLong {
        /// The offending token.
        token: u32,
        /// Size the detokenizer asked for on the retry.
        required: usize,
    },

    /// Chat template rendering failed.
    #[error("Template error: {0}")]
    Template(String),

    /// A replay script was malformed.
    #[error("Invalid replay script: {0}")]
    Script(String),
}

/// Result type for LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;

impl From<minijinja::Error> for LlmError {
    fn from(value: minijinja::Error) -> Self {
        Self::Template(value.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Script(value.to_string())
    }
}
