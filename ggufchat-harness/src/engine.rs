//! Chat engine: one inference context, one conversation.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ggufchat_llm::{
    ChunkSink, FinishReason, GenerationRequest, Generator, InferenceContext, LlmError,
};

use crate::config::{
    ChatConfig, validate_max_tokens, validate_temperature, validate_top_k, validate_top_p,
};
use crate::error::{HarnessError, HarnessResult};
use crate::history::{ConversationHistory, Exchange};
use crate::prompt::ChatPromptBuilder;

/// A cleaned assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub content: String,
    pub finish_reason: FinishReason,
    pub tokens_generated: usize,
}

struct Session {
    config: ChatConfig,
    history: ConversationHistory,
    builder: ChatPromptBuilder,
}

/// Clears the generating flag when a call ends, however it ends.
struct GeneratingGuard<'a>(&'a AtomicBool);

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns an inference context and the conversation built on top of it.
///
/// Only one reply is generated at a time. A second call made while one is
/// running fails with [`HarnessError::Busy`] instead of waiting.
pub struct ChatEngine<C: InferenceContext> {
    context: Mutex<Option<C>>,
    session: Mutex<Session>,
    generating: AtomicBool,
}

impl<C: InferenceContext> ChatEngine<C> {
    /// Create an engine with no context loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(config: ChatConfig) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            context: Mutex::new(None),
            session: Mutex::new(Session {
                history: ConversationHistory::new(config.max_history_pairs),
                builder: ChatPromptBuilder::new(config.template()),
                config,
            }),
            generating: AtomicBool::new(false),
        })
    }

    /// Install `context`, returning the one it replaces.
    ///
    /// # Errors
    ///
    /// Fails with [`HarnessError::Busy`] while a reply is being generated.
    pub fn load(&self, context: C) -> HarnessResult<Option<C>> {
        if self.is_generating() {
            return Err(HarnessError::Busy);
        }
        let previous = self.context.lock().replace(context);
        info!("Inference context loaded");
        Ok(previous)
    }

    /// Remove the context and forget the conversation.
    ///
    /// # Errors
    ///
    /// Fails with [`HarnessError::Busy`] while a reply is being generated.
    pub fn release(&self) -> HarnessResult<Option<C>> {
        if self.is_generating() {
            return Err(HarnessError::Busy);
        }
        let context = self.context.lock().take();
        self.session.lock().history.clear();
        info!("Resources released");
        Ok(context)
    }

    /// Whether a context is installed. A context in use by a running
    /// generation counts as loaded.
    pub fn is_loaded(&self) -> bool {
        self.context.try_lock().is_none_or(|context| context.is_some())
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Generate a reply to `user_input` and record the exchange.
    ///
    /// When streaming is enabled and `sink` is given, chunks are delivered
    /// to it as they become safe. Otherwise the sink is never called.
    ///
    /// The context stays locked while the sink runs. Calls the sink makes
    /// back into this engine see [`HarnessError::Busy`] from `generate`,
    /// `load` and `release`. Configuration getters and setters stay usable.
    ///
    /// # Errors
    ///
    /// Fails with [`HarnessError::Busy`] when a reply is already being
    /// generated, and with [`LlmError::InvalidSession`] when no context is
    /// loaded.
    pub fn generate(
        &self,
        user_input: &str,
        sink: Option<&mut dyn ChunkSink>,
    ) -> HarnessResult<ChatReply> {
        if self.generating.swap(true, Ordering::SeqCst) {
            return Err(HarnessError::Busy);
        }
        let _guard = GeneratingGuard(&self.generating);

        let mut slot = self.context.lock();
        let context = slot
            .as_mut()
            .ok_or_else(|| LlmError::InvalidSession("Model not loaded".into()))?;

        let (request, policy, streaming) = {
            let session = self.session.lock();
            let prompt =
                session
                    .builder
                    .build(&session.config.system_prompt, &session.history, user_input)?;
            let request = GenerationRequest::new(prompt)
                .with_max_tokens(session.config.max_tokens)
                .with_sampling(session.config.sampling());
            (request, session.config.stop, session.config.streaming)
        };

        debug!("Generate called, streaming mode: {}", streaming);
        let mut generator = Generator::new(context).with_policy(policy);
        let completion = match sink {
            Some(sink) if streaming => generator.generate_streaming(&request, sink)?,
            _ => generator.generate(&request)?,
        };
        drop(slot);

        let content = ChatPromptBuilder::clean_response(&completion.text);
        self.session
            .lock()
            .history
            .push(user_input, content.as_str());
        debug!(
            "Generation completed: {} ({} tokens, {} bytes)",
            completion.finish_reason,
            completion.tokens_generated,
            content.len()
        );

        Ok(ChatReply {
            content,
            finish_reason: completion.finish_reason,
            tokens_generated: completion.tokens_generated,
        })
    }

    pub fn config(&self) -> ChatConfig {
        self.session.lock().config.clone()
    }

    /// Replace the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid; the old one stays in effect.
    pub fn set_config(&self, config: ChatConfig) -> HarnessResult<()> {
        config.validate()?;
        let mut session = self.session.lock();
        session.history.set_max_pairs(config.max_history_pairs);
        session.builder = ChatPromptBuilder::new(config.template());
        session.config = config;
        debug!("Config updated");
        Ok(())
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.session.lock().config.system_prompt = prompt.into();
        debug!("System prompt updated");
    }

    /// # Errors
    ///
    /// Fails when `temperature` is negative.
    pub fn set_temperature(&self, temperature: f32) -> HarnessResult<()> {
        validate_temperature(temperature)?;
        self.session.lock().config.temperature = temperature;
        debug!("Temperature set to: {}", temperature);
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when `top_p` is outside `[0, 1]`.
    pub fn set_top_p(&self, top_p: f32) -> HarnessResult<()> {
        validate_top_p(top_p)?;
        self.session.lock().config.top_p = top_p;
        debug!("TopP set to: {}", top_p);
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when `top_k` is zero.
    pub fn set_top_k(&self, top_k: usize) -> HarnessResult<()> {
        validate_top_k(top_k)?;
        self.session.lock().config.top_k = top_k;
        debug!("TopK set to: {}", top_k);
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when `max_tokens` is zero.
    pub fn set_max_tokens(&self, max_tokens: usize) -> HarnessResult<()> {
        validate_max_tokens(max_tokens)?;
        self.session.lock().config.max_tokens = max_tokens;
        debug!("MaxTokens set to: {}", max_tokens);
        Ok(())
    }

    /// Cap the history at `max_pairs` exchanges (0 for no cap), trimming now.
    pub fn set_max_history_pairs(&self, max_pairs: usize) {
        let mut session = self.session.lock();
        session.config.max_history_pairs = max_pairs;
        session.history.set_max_pairs(max_pairs);
        debug!("MaxHistoryPairs set to: {}", max_pairs);
    }

    pub fn set_streaming(&self, enabled: bool) {
        self.session.lock().config.streaming = enabled;
        debug!("Streaming mode set to: {}", enabled);
    }

    pub fn is_streaming(&self) -> bool {
        self.session.lock().config.streaming
    }

    pub fn clear_history(&self) {
        self.session.lock().history.clear();
    }

    /// Number of recorded exchanges.
    pub fn history_len(&self) -> usize {
        self.session.lock().history.len()
    }

    pub fn history(&self) -> Vec<Exchange> {
        self.session.lock().history.exchanges().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggufchat_llm::ScriptedContext;

    fn engine(fragments: &[&str]) -> ChatEngine<ScriptedContext> {
        let engine = ChatEngine::new(ChatConfig::default()).unwrap();
        engine
            .load(ScriptedContext::from_fragments(fragments.iter().copied()))
            .unwrap();
        engine
    }

    #[test]
    fn test_generate_without_context() {
        let engine: ChatEngine<ScriptedContext> = ChatEngine::new(ChatConfig::default()).unwrap();
        assert!(!engine.is_loaded());
        let err = engine.generate("hi", None).unwrap_err();
        assert!(matches!(err, HarnessError::Llm(LlmError::InvalidSession(_))));
        assert!(!engine.is_generating());
    }

    #[test]
    fn test_reentrant_generate_is_busy() {
        let engine = engine(&["one", " two"]);
        let mut nested = Vec::new();
        let mut sink = |chunk: &str| {
            assert!(engine.is_generating());
            nested.push((chunk.to_owned(), engine.generate("again", None)));
        };
        let reply = engine.generate("hi", Some(&mut sink)).unwrap();

        assert_eq!(reply.content, "one two");
        assert_eq!(nested.len(), 2);
        assert!(
            nested
                .iter()
                .all(|(_, result)| matches!(result, Err(HarnessError::Busy)))
        );
        assert!(!engine.is_generating());
        assert_eq!(engine.history_len(), 1);
    }

    #[test]
    fn test_sink_cannot_swap_the_context() {
        let engine = engine(&["a", "b"]);
        let mut calls = 0;
        let mut sink = |_: &str| {
            calls += 1;
            assert!(matches!(engine.release(), Err(HarnessError::Busy)));
            let replacement = ScriptedContext::from_fragments(["z"]);
            assert!(matches!(engine.load(replacement), Err(HarnessError::Busy)));
            assert!(engine.is_loaded());
            engine.set_temperature(0.1).unwrap();
        };
        let reply = engine.generate("hi", Some(&mut sink)).unwrap();

        assert_eq!(calls, 2);
        assert_eq!(reply.content, "ab");
        assert_eq!(engine.config().temperature, 0.1);
        assert!(engine.release().unwrap().is_some());
    }

    #[test]
    fn test_invalid_setters_leave_config_untouched() {
        let engine = engine(&[]);
        assert!(engine.set_temperature(-1.0).is_err());
        assert!(engine.set_top_p(2.0).is_err());
        assert!(engine.set_top_k(0).is_err());
        assert!(engine.set_max_tokens(0).is_err());
        assert_eq!(engine.config(), ChatConfig::default());

        engine.set_top_k(5).unwrap();
        assert_eq!(engine.config().top_k, 5);
    }

    #[test]
    fn test_release_clears_history() {
        let engine = engine(&["ok"]);
        engine.generate("hi", None).unwrap();
        assert_eq!(engine.history_len(), 1);
        assert!(engine.release().unwrap().is_some());
        assert!(!engine.is_loaded());
        assert_eq!(engine.history_len(), 0);
    }
}
