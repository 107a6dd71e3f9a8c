//! Core types for chat generation.

use serde::{Deserialize, Serialize};

/// Opaque token identifier issued by the inference context.
pub type TokenId = u32;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions to the model.
    System,
    /// User message from the human.
    User,
    /// Assistant message from the model.
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Create a new system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The context flagged the sampled token as end-of-generation.
    EndOfGeneration,
    /// The literal stop marker appeared in the output.
    StopMarker,
    /// A new conversational turn started in the output.
    RoleSwitch,
    /// The safety ceiling on decoded tokens was exceeded.
    TokenCeiling,
    /// A short answer ended on sentence-terminal punctuation.
    SentenceComplete,
    /// The caller's maximum token count was reached.
    Length,
    /// Incremental decode failed mid-generation; output is partial.
    DecodeFailed,
    /// A token rendered to an oversized fragment; output is partial.
    FragmentTooLong,
}

impl FinishReason {
    /// Whether the output was cut short by a failure rather than a stop rule.
    #[must_use]
    pub fn is_partial(self) -> bool {
        matches!(self, Self::DecodeFailed | Self::FragmentTooLong)
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EndOfGeneration => "end_of_generation",
            Self::StopMarker => "stop_marker",
            Self::RoleSwitch => "role_switch",
            Self::TokenCeiling => "token_ceiling",
            Self::SentenceComplete => "sentence_complete",
            Self::Length => "length",
            Self::DecodeFailed => "decode_failed",
            Self::FragmentTooLong => "fragment_too_long",
        };
        f.write_str(name)
    }
}

/// Result of one generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Full generated text, truncated before the first stop marker.
    pub text: String,
    /// Reason generation ended.
    pub finish_reason: FinishReason,
    /// Number of sampled tokens whose fragment was appended to the output.
    pub tokens_generated: usize,
    /// Number of tokens the prompt was encoded to.
    pub prompt_tokens: usize,
}
