//! Stop-condition evaluation.
//!
//! Several independent heuristics decide when a generation call ends. They
//! are checked in a fixed order and the first one that matches wins:
//!
//! 1. the sampled token is end-of-generation (nothing is appended for it);
//! 2. the stop marker is complete in the pending output (handled by the
//!    [`EmissionBuffer`](crate::emission::EmissionBuffer), or by the
//!    collector on the non-streaming path);
//! 3. the role-switch marker appears past the lead-in;
//! 4. the decoded-token count exceeds the safety ceiling;
//! 5. a short answer ends on sentence-terminal punctuation.

use serde::{Deserialize, Serialize};

use crate::marker::MarkerMatcher;
use crate::types::FinishReason;

/// Ideographic full stop, U+3002.
const CJK_FULL_STOP: &[u8] = "\u{3002}".as_bytes();

/// ASCII characters that end a sentence for the early-stop heuristic.
const ASCII_TERMINALS: &[u8] = b".!?\n";

/// Tunable thresholds for the heuristic stop rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopPolicy {
    /// Stop once more than this many tokens have been decoded.
    pub token_ceiling: usize,
    /// The sentence heuristic only applies above this many decoded tokens.
    pub sentence_min_tokens: usize,
    /// The sentence heuristic only applies below this many decoded tokens.
    pub sentence_max_tokens: usize,
    /// The role-switch marker only counts when it starts past this byte offset.
    pub role_switch_lead_in: usize,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            token_ceiling: 256,
            sentence_min_tokens: 50,
            sentence_max_tokens: 100,
            role_switch_lead_in: 10,
        }
    }
}

/// Applies a [`StopPolicy`] to the output of one generation call.
///
/// The output only ever grows, so the role-switch search resumes where the
/// previous check left off. Use a fresh evaluator for every call.
#[derive(Debug, Clone)]
pub struct StopEvaluator {
    policy: StopPolicy,
    role_switch: MarkerMatcher,
    /// Bytes of the output already searched for the role-switch marker.
    scanned: usize,
    /// Offset of the first role-switch marker, once seen.
    role_switch_at: Option<usize>,
}

impl StopEvaluator {
    /// Create an evaluator for `policy`.
    #[must_use]
    pub fn new(policy: StopPolicy) -> Self {
        Self {
            policy,
            role_switch: MarkerMatcher::role_switch(),
            scanned: 0,
            role_switch_at: None,
        }
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &StopPolicy {
        &self.policy
    }

    /// Rule 1, checked before the token is rendered.
    #[must_use]
    pub fn check_token(&self, is_end_of_generation: bool) -> Option<FinishReason> {
        is_end_of_generation.then_some(FinishReason::EndOfGeneration)
    }

    /// Rules 3 to 5, checked after a fragment has been appended and the stop
    /// marker has been ruled out.
    ///
    /// `total` is every byte generated so far and `decoded` the number of
    /// tokens that contributed to it. `total` must extend the one passed to
    /// the previous check.
    #[must_use]
    pub fn check_output(&mut self, total: &[u8], decoded: usize) -> Option<FinishReason> {
        if let Some(pos) = self.first_role_switch(total)
            && pos > self.policy.role_switch_lead_in
        {
            tracing::debug!("Stopping: found new role marker at byte {}", pos);
            return Some(FinishReason::RoleSwitch);
        }

        if decoded > self.policy.token_ceiling {
            tracing::debug!("Stopping: reached max reasonable tokens ({})", decoded);
            return Some(FinishReason::TokenCeiling);
        }

        if decoded > self.policy.sentence_min_tokens
            && decoded < self.policy.sentence_max_tokens
            && ends_sentence(total)
        {
            tracing::debug!("Stopping: short complete response at {} tokens", decoded);
            return Some(FinishReason::SentenceComplete);
        }

        None
    }

    // Only the first occurrence counts, so the search ends once it is found.
    fn first_role_switch(&mut self, total: &[u8]) -> Option<usize> {
        if self.role_switch_at.is_none() {
            self.role_switch_at = self.role_switch.find_complete_from(total, self.scanned);
            self.scanned = total.len();
        }
        self.role_switch_at
    }
}

impl Default for StopEvaluator {
    fn default() -> Self {
        Self::new(StopPolicy::default())
    }
}

/// Whether `text` ends in a recognized sentence terminator.
#[must_use]
pub fn ends_sentence(text: &[u8]) -> bool {
    text.ends_with(CJK_FULL_STOP)
        || text
            .last()
            .is_some_and(|last| ASCII_TERMINALS.contains(last))
}
