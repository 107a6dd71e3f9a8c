//! Inference backends.
//!
//! The generation loop never talks to an engine directly. It drives an
//! [`InferenceContext`], which owns the model state (tokenizer, sequence
//! cache, vocabulary) and hands out samplers for each call.

mod scripted;

pub use scripted::{
    END_OF_GENERATION_TOKEN, Fragment, ReplayScript, ScriptedContext, ScriptedSampler,
};

use crate::error::LlmResult;
use crate::sampling::SamplingParams;
use crate::types::TokenId;

/// An output buffer was too small. `required` is the size the callee needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTooSmall {
    pub required: usize,
}

impl std::fmt::Display for BufferTooSmall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer too small, {} required", self.required)
    }
}

impl std::error::Error for BufferTooSmall {}

/// A sampler chain instance owned by one generation call.
///
/// Released through `Drop` when the call ends.
pub trait TokenSampler {
    /// Record that `token` was accepted into the sequence.
    fn accept(&mut self, token: TokenId);
}

/// The inference engine as seen by the generation loop.
pub trait InferenceContext {
    /// Sampler type handed out by [`new_sampler`](Self::new_sampler).
    type Sampler: TokenSampler;

    /// Clear any decode state carried over from a previous call.
    fn reset_sequence(&mut self);

    /// Build a sampler chain for `params`.
    ///
    /// Fails with [`LlmError::InvalidSession`](crate::LlmError::InvalidSession)
    /// when the context cannot produce one.
    fn new_sampler(&mut self, params: &SamplingParams) -> LlmResult<Self::Sampler>;

    /// Tokenize `text` into `out`, returning the number of tokens written.
    fn tokenize(&self, text: &str, out: &mut [TokenId]) -> Result<usize, BufferTooSmall>;

    /// Feed `tokens` to the model, advancing the sequence position.
    fn decode(&mut self, tokens: &[TokenId]) -> LlmResult<()>;

    /// Sample the next token after the last decode.
    fn sample(&mut self, sampler: &mut Self::Sampler) -> TokenId;

    /// Render `token` into `out`, returning the number of bytes written.
    fn token_to_piece(&self, token: TokenId, out: &mut [u8]) -> Result<usize, BufferTooSmall>;

    /// Whether `token` ends generation.
    fn is_end_of_generation(&self, token: TokenId) -> bool;
}
