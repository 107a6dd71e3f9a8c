//! Configuration management for chat sessions.
//!
//! Sampling defaults can be overridden with environment variables:
//! - `GGUFCHAT_TEMPERATURE` (default: 0.7)
//! - `GGUFCHAT_TOP_P` (default: 0.9)
//! - `GGUFCHAT_TOP_K` (default: 40)
//! - `GGUFCHAT_MAX_TOKENS` (default: 512)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use ggufchat_llm::{ChatTemplate, DEFAULT_SEED, SamplingParams, StopPolicy};

use crate::error::{HarnessError, HarnessResult};
use crate::paths::CONFIG_FILE;

/// Persona used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Answer clearly and concisely.";

/// Chat session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Temperature for generation. Zero selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Top-p (nucleus) sampling threshold.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Top-k sampling limit.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Maximum tokens sampled per reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Exchanges kept in the prompt. 0 keeps everything.
    #[serde(default = "default_max_history_pairs")]
    pub max_history_pairs: usize,
    /// System message placed at the top of every prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Deliver replies chunk by chunk.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Seed for the sampler's distribution draw.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Jinja2 chat template. ChatML when unset.
    #[serde(default)]
    pub chat_template: Option<String>,
    /// Heuristic stop thresholds.
    #[serde(default)]
    pub stop: StopPolicy,
}

fn env_or<T: FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn default_temperature() -> f32 {
    env_or("GGUFCHAT_TEMPERATURE", 0.7)
}

fn default_top_p() -> f32 {
    env_or("GGUFCHAT_TOP_P", 0.9)
}

fn default_top_k() -> usize {
    env_or("GGUFCHAT_TOP_K", 40)
}

fn default_max_tokens() -> usize {
    env_or("GGUFCHAT_MAX_TOKENS", 512)
}

fn default_max_history_pairs() -> usize {
    10
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
            max_history_pairs: default_max_history_pairs(),
            system_prompt: default_system_prompt(),
            streaming: true,
            seed: default_seed(),
            chat_template: None,
            stop: StopPolicy::default(),
        }
    }
}

impl ChatConfig {
    /// Load the global configuration file, or defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load() -> HarnessResult<Self> {
        if CONFIG_FILE.exists() {
            Self::load_from(&CONFIG_FILE)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChatConfig = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save to the global configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be saved.
    pub fn save(&self) -> HarnessResult<()> {
        self.save_to(&CONFIG_FILE)
    }

    /// Save configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written.
    pub fn save_to(&self, path: &Path) -> HarnessResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| HarnessError::Config(format!("Failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> HarnessResult<()> {
        validate_temperature(self.temperature)?;
        validate_top_p(self.top_p)?;
        validate_top_k(self.top_k)?;
        validate_max_tokens(self.max_tokens)?;

        if self.stop.sentence_min_tokens >= self.stop.sentence_max_tokens {
            return Err(HarnessError::Config(format!(
                "stop.sentence_min_tokens ({}) must be below stop.sentence_max_tokens ({})",
                self.stop.sentence_min_tokens, self.stop.sentence_max_tokens
            )));
        }

        self.template()
            .validate()
            .map_err(|e| HarnessError::Config(format!("Invalid chat_template: {e}")))
    }

    /// Sampler chain parameters.
    #[must_use]
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            seed: self.seed,
        }
    }

    /// The configured chat template, or ChatML.
    #[must_use]
    pub fn template(&self) -> ChatTemplate {
        match &self.chat_template {
            Some(source) => ChatTemplate::new(source.as_str()),
            None => ChatTemplate::chatml(),
        }
    }
}

/// # Errors
///
/// Fails when `temperature` is negative or not finite.
pub fn validate_temperature(temperature: f32) -> HarnessResult<()> {
    if temperature.is_finite() && temperature >= 0.0 {
        Ok(())
    } else {
        Err(HarnessError::Config(format!(
            "Temperature must be >= 0, got {temperature}"
        )))
    }
}

/// # Errors
///
/// Fails when `top_p` is outside `[0, 1]`.
pub fn validate_top_p(top_p: f32) -> HarnessResult<()> {
    if (0.0..=1.0).contains(&top_p) {
        Ok(())
    } else {
        Err(HarnessError::Config(format!(
            "TopP must be between 0 and 1, got {top_p}"
        )))
    }
}

/// # Errors
///
/// Fails when `top_k` is zero.
pub fn validate_top_k(top_k: usize) -> HarnessResult<()> {
    if top_k > 0 {
        Ok(())
    } else {
        Err(HarnessError::Config("TopK must be > 0".into()))
    }
}

/// # Errors
///
/// Fails when `max_tokens` is zero.
pub fn validate_max_tokens(max_tokens: usize) -> HarnessResult<()> {
    if max_tokens > 0 {
        Ok(())
    } else {
        Err(HarnessError::Config("MaxTokens must be > 0".into()))
    }
}
