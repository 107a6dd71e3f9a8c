//! Replay backend driven by a recorded fragment script.
//!
//! Each generation call plays one turn of the script: the *i*-th sampled
//! token renders to the *i*-th fragment of the turn. When a turn runs out the
//! context either reports end-of-generation or keeps sampling a filler
//! fragment. A handful of switches inject the failures a real engine can
//! produce, so the generation loop can be exercised without a model.
//!
//! A script can also carry logit rows. Steps that have one draw their
//! fragment through the sampler chain instead of taking the next in order.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::{BufferTooSmall, InferenceContext, TokenSampler};
use crate::error::{LlmError, LlmResult};
use crate::sampling::{LogitsSampler, SamplingParams};
use crate::types::TokenId;

/// Token the scripted context reports as end-of-generation.
pub const END_OF_GENERATION_TOKEN: TokenId = 2;

/// First token id used for scripted fragments. Prompt tokens are byte
/// values and stay below it.
const FRAGMENT_TOKEN_BASE: TokenId = 1_000;

/// One recorded detokenizer output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fragment {
    /// Valid text, written as a JSON string.
    Text(String),
    /// Raw bytes, written as a JSON array of numbers. Used for fragments
    /// that split a character.
    Bytes(Vec<u8>),
}

impl Fragment {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for Fragment {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Fragment {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&[u8]> for Fragment {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Fragment {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Serialized form of a replay session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayScript {
    /// One fragment list per generation call. Calls past the last turn
    /// replay the last turn again.
    pub turns: Vec<Vec<Fragment>>,
    /// Sampled forever once a turn is exhausted. Without it the context
    /// reports end-of-generation.
    pub filler: Option<Fragment>,
    /// Prompt tokens produced per prompt byte.
    pub tokens_per_byte: usize,
    /// The tokenizer asks for more room on every attempt.
    pub undersized_tokenizer: bool,
    /// Zero-based decode call (counted per generation call, prompt included)
    /// that fails.
    pub fail_decode_at: Option<usize>,
    /// The context refuses to build a sampler.
    pub fail_sampler: bool,
    /// Zero-based fragment index whose piece never fits the buffer.
    pub oversized_piece_at: Option<usize>,
    /// Sequence capacity in tokens.
    pub context_length: usize,
    /// Logits over the turn's fragment indices, one row per sampling step
    /// of every turn. Steps past the last row replay in order.
    pub logits: Vec<Vec<f32>>,
}

impl Default for ReplayScript {
    fn default() -> Self {
        Self {
            turns: Vec::new(),
            filler: None,
            tokens_per_byte: 1,
            undersized_tokenizer: false,
            fail_decode_at: None,
            fail_sampler: false,
            oversized_piece_at: None,
            context_length: 4096,
            logits: Vec::new(),
        }
    }
}

impl ReplayScript {
    /// Single-turn script.
    pub fn from_fragments<I, F>(fragments: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Fragment>,
    {
        Self {
            turns: vec![fragments.into_iter().map(Into::into).collect()],
            ..Self::default()
        }
    }

    /// Add another turn.
    #[must_use]
    pub fn with_turn<I, F>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Fragment>,
    {
        self.turns.push(fragments.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_filler(mut self, filler: impl Into<Fragment>) -> Self {
        self.filler = Some(filler.into());
        self
    }

    #[must_use]
    pub fn with_tokens_per_byte(mut self, tokens_per_byte: usize) -> Self {
        self.tokens_per_byte = tokens_per_byte;
        self
    }

    #[must_use]
    pub fn with_undersized_tokenizer(mut self) -> Self {
        self.undersized_tokenizer = true;
        self
    }

    #[must_use]
    pub fn with_decode_failure_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    #[must_use]
    pub fn with_sampler_failure(mut self) -> Self {
        self.fail_sampler = true;
        self
    }

    #[must_use]
    pub fn with_oversized_piece_at(mut self, index: usize) -> Self {
        self.oversized_piece_at = Some(index);
        self
    }

    #[must_use]
    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    #[must_use]
    pub fn with_logits(mut self, logits: Vec<Vec<f32>>) -> Self {
        self.logits = logits;
        self
    }

    /// Parse a script from JSON.
    pub fn from_json(json: &str) -> LlmResult<Self> {
        let script: Self = serde_json::from_str(json)?;
        if script.tokens_per_byte == 0 {
            return Err(LlmError::Script("tokens_per_byte must be at least 1".into()));
        }
        Ok(script)
    }

    /// Read and parse a JSON script file.
    pub fn load(path: &Path) -> LlmResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| LlmError::Script(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}

/// Sampler handed out by [`ScriptedContext`].
pub struct ScriptedSampler {
    chain: LogitsSampler,
    accepted: Vec<TokenId>,
    live: Arc<AtomicUsize>,
}

impl ScriptedSampler {
    pub fn params(&self) -> &SamplingParams {
        self.chain.params()
    }

    pub fn accepted(&self) -> &[TokenId] {
        &self.accepted
    }
}

impl TokenSampler for ScriptedSampler {
    fn accept(&mut self, token: TokenId) {
        self.chain.accept(token);
        self.accepted.push(token);
    }
}

impl Drop for ScriptedSampler {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`InferenceContext`] that replays a [`ReplayScript`].
pub struct ScriptedContext {
    script: ReplayScript,
    turn: Option<usize>,
    cursor: usize,
    position: usize,
    decode_calls: usize,
    resets: usize,
    live_samplers: Arc<AtomicUsize>,
}

impl ScriptedContext {
    pub fn new(script: ReplayScript) -> Self {
        Self {
            script,
            turn: None,
            cursor: 0,
            position: 0,
            decode_calls: 0,
            resets: 0,
            live_samplers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Single-turn context over `fragments`.
    pub fn from_fragments<I, F>(fragments: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Fragment>,
    {
        Self::new(ReplayScript::from_fragments(fragments))
    }

    /// Samplers created and not yet dropped.
    pub fn live_samplers(&self) -> usize {
        self.live_samplers.load(Ordering::SeqCst)
    }

    /// Shared handle on the live-sampler count, usable after the context
    /// has been moved elsewhere.
    pub fn sampler_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_samplers)
    }

    /// Number of times the sequence has been reset.
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Tokens currently in the sequence.
    pub fn position(&self) -> usize {
        self.position
    }

    fn current_turn(&self) -> &[Fragment] {
        let turns = &self.script.turns;
        match (self.turn, turns.len()) {
            (_, 0) => &[],
            (Some(turn), len) => &turns[turn.min(len - 1)],
            (None, _) => &turns[0],
        }
    }

    fn fragment_for(&self, token: TokenId) -> Option<&Fragment> {
        let index = token.checked_sub(FRAGMENT_TOKEN_BASE)? as usize;
        let turn = self.current_turn();
        match turn.get(index) {
            Some(fragment) => Some(fragment),
            None => self.script.filler.as_ref(),
        }
    }
}

impl InferenceContext for ScriptedContext {
    type Sampler = ScriptedSampler;

    fn reset_sequence(&mut self) {
        self.turn = Some(self.turn.map_or(0, |turn| turn + 1));
        self.cursor = 0;
        self.position = 0;
        self.decode_calls = 0;
        self.resets += 1;
    }

    fn new_sampler(&mut self, params: &SamplingParams) -> LlmResult<Self::Sampler> {
        if self.script.fail_sampler {
            return Err(LlmError::InvalidSession(
                "scripted context refused to build a sampler".into(),
            ));
        }
        self.live_samplers.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSampler {
            chain: LogitsSampler::new(*params),
            accepted: Vec::new(),
            live: Arc::clone(&self.live_samplers),
        })
    }

    fn tokenize(&self, text: &str, out: &mut [TokenId]) -> Result<usize, BufferTooSmall> {
        let per_byte = self.script.tokens_per_byte.max(1);
        let required = text.len() * per_byte;
        if self.script.undersized_tokenizer || required > out.len() {
            return Err(BufferTooSmall {
                required: required.max(out.len() + 1),
            });
        }
        let tokens = text
            .bytes()
            .flat_map(|byte| std::iter::repeat_n(TokenId::from(byte), per_byte));
        for (slot, token) in out.iter_mut().zip(tokens) {
            *slot = token;
        }
        Ok(required)
    }

    fn decode(&mut self, tokens: &[TokenId]) -> LlmResult<()> {
        let call = self.decode_calls;
        self.decode_calls += 1;
        if self.script.fail_decode_at == Some(call) {
            return Err(LlmError::InvalidSession(format!(
                "scripted decode failure on call {call}"
            )));
        }
        if self.position + tokens.len() > self.script.context_length {
            return Err(LlmError::InvalidSession(format!(
                "context full: {} + {} tokens exceeds {}",
                self.position,
                tokens.len(),
                self.script.context_length
            )));
        }
        self.position += tokens.len();
        Ok(())
    }

    fn sample(&mut self, sampler: &mut Self::Sampler) -> TokenId {
        if let Some(row) = self.script.logits.get(self.cursor)
            && let Some(index) = sampler.chain.sample(row)
        {
            self.cursor += 1;
            return FRAGMENT_TOKEN_BASE + index;
        }

        let available = self.current_turn().len();
        if self.cursor >= available && self.script.filler.is_none() {
            return END_OF_GENERATION_TOKEN;
        }
        let token = FRAGMENT_TOKEN_BASE + self.cursor.min(available) as TokenId;
        self.cursor += 1;
        token
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8]) -> Result<usize, BufferTooSmall> {
        let index = token.checked_sub(FRAGMENT_TOKEN_BASE).map(|i| i as usize);
        if index.is_some() && index == self.script.oversized_piece_at {
            return Err(BufferTooSmall {
                required: out.len() + 1,
            });
        }
        let piece = self.fragment_for(token).map(Fragment::as_bytes).unwrap_or_default();
        if piece.len() > out.len() {
            return Err(BufferTooSmall {
                required: piece.len(),
            });
        }
        out[..piece.len()].copy_from_slice(piece);
        Ok(piece.len())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == END_OF_GENERATION_TOKEN
    }
}
