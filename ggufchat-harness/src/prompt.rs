//! Prompt construction and response cleanup.

use ggufchat_llm::{ChatMessage, ChatTemplate, LlmResult, ROLE_SWITCH_MARKER, STOP_MARKER};

use crate::history::ConversationHistory;

/// Turn-start markers removed from replies, after the stop marker. A bare
/// marker left over from a role switch goes last.
const ROLE_MARKERS: [&str; 4] = [
    "<|im_start|>system",
    "<|im_start|>user",
    "<|im_start|>assistant",
    ROLE_SWITCH_MARKER,
];

/// Builds ChatML prompts from the system message, history and new input.
#[derive(Debug, Clone, Default)]
pub struct ChatPromptBuilder {
    template: ChatTemplate,
}

impl ChatPromptBuilder {
    pub fn new(template: ChatTemplate) -> Self {
        Self { template }
    }

    /// Render the prompt for `user_input`, ending with an open assistant turn.
    pub fn build(
        &self,
        system_prompt: &str,
        history: &ConversationHistory,
        user_input: &str,
    ) -> LlmResult<String> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(history.messages());
        messages.push(ChatMessage::user(user_input));

        let prompt = self.template.apply(&messages)?;
        tracing::debug!(
            "Built prompt with {} history exchanges ({} bytes)",
            history.len(),
            prompt.len()
        );
        Ok(prompt)
    }

    /// Strip chat markers and surrounding whitespace from a raw reply.
    #[must_use]
    pub fn clean_response(response: &str) -> String {
        let mut cleaned = response.trim().replace(STOP_MARKER, "");
        for marker in ROLE_MARKERS {
            cleaned = cleaned.replace(marker, "");
        }
        cleaned.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_history() {
        let mut history = ConversationHistory::new(10);
        history.push("Hi", "Hello!");
        let prompt = ChatPromptBuilder::default()
            .build("Be nice.", &history, "Bye")
            .unwrap();
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe nice.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\nHello!<|im_end|>\n\
             <|im_start|>user\nBye<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_build_without_history() {
        let prompt = ChatPromptBuilder::default()
            .build("S", &ConversationHistory::default(), "U")
            .unwrap();
        assert!(prompt.starts_with("<|im_start|>system\nS<|im_end|>\n<|im_start|>user\nU"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_clean_response() {
        assert_eq!(
            ChatPromptBuilder::clean_response("  Sure thing\n<|im_start|>user\n"),
            "Sure thing"
        );
        assert_eq!(
            ChatPromptBuilder::clean_response("<|im_start|>assistant\nHi<|im_end|>"),
            "Hi"
        );
        assert_eq!(
            ChatPromptBuilder::clean_response("Done.\n<|im_start|>"),
            "Done."
        );
        assert_eq!(ChatPromptBuilder::clean_response("plain"), "plain");
        assert_eq!(ChatPromptBuilder::clean_response("<|im_end|>"), "");
    }
}
