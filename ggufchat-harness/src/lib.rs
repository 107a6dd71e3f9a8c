//! Chat sessions on top of the ggufchat generation core.
//!
//! This crate provides the [`ChatEngine`] that turns user input into ChatML
//! prompts, runs them through an inference context and keeps the
//! conversation history, as well as configuration management.

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod paths;
pub mod prompt;

pub use config::{ChatConfig, DEFAULT_SYSTEM_PROMPT};
pub use engine::{ChatEngine, ChatReply};
pub use error::{HarnessError, HarnessResult};
pub use history::{ConversationHistory, Exchange};
pub use prompt::ChatPromptBuilder;
