//! Conversation history.

use serde::{Deserialize, Serialize};

use ggufchat_llm::ChatMessage;

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Completed exchanges, oldest first, capped at a number of pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    exchanges: Vec<Exchange>,
    max_pairs: usize,
}

impl ConversationHistory {
    /// Create an empty history keeping at most `max_pairs` exchanges.
    /// Zero means no limit.
    #[must_use]
    pub fn new(max_pairs: usize) -> Self {
        Self {
            exchanges: Vec::new(),
            max_pairs,
        }
    }

    #[must_use]
    pub fn max_pairs(&self) -> usize {
        self.max_pairs
    }

    /// Change the cap and trim immediately.
    pub fn set_max_pairs(&mut self, max_pairs: usize) {
        self.max_pairs = max_pairs;
        self.trim();
    }

    /// Record an exchange, dropping the oldest ones past the cap.
    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.exchanges.push(Exchange {
            user: user.into(),
            assistant: assistant.into(),
        });
        self.trim();
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
        tracing::debug!("Conversation history cleared");
    }

    /// Number of exchanges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// The exchanges as alternating user and assistant messages.
    pub fn messages(&self) -> impl Iterator<Item = ChatMessage> + '_ {
        self.exchanges.iter().flat_map(|exchange| {
            [
                ChatMessage::user(exchange.user.as_str()),
                ChatMessage::assistant(exchange.assistant.as_str()),
            ]
        })
    }

    fn trim(&mut self) {
        if self.max_pairs == 0 || self.exchanges.len() <= self.max_pairs {
            return;
        }
        let excess = self.exchanges.len() - self.max_pairs;
        self.exchanges.drain(..excess);
        tracing::debug!(
            "History trimmed, removed {} exchanges, remaining: {}",
            excess,
            self.exchanges.len()
        );
    }
}
