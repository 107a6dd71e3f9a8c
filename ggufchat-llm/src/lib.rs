//! Streaming text generation over a GGUF inference context.
//!
//! This crate turns sampled tokens into text that is safe to show as it
//! arrives: chunks never end inside a UTF-8 character and never contain the
//! ChatML stop marker, even when either is split across token fragments.

pub mod backend;
pub mod chat_template;
pub mod emission;
pub mod error;
pub mod generation;
pub mod marker;
pub mod sampling;
pub mod stop;
pub mod types;
pub mod utf8;

pub use backend::{
    BufferTooSmall, END_OF_GENERATION_TOKEN, Fragment, InferenceContext, ReplayScript,
    ScriptedContext, ScriptedSampler, TokenSampler,
};
pub use chat_template::{CHATML_TEMPLATE, ChatTemplate};
pub use emission::{Emission, EmissionBuffer, MarkerCollector};
pub use error::{LlmError, LlmResult};
pub use generation::{ChunkSink, GenerationRequest, Generator, PIECE_BUFFER_LEN};
pub use marker::{MarkerMatcher, ROLE_SWITCH_MARKER, STOP_MARKER};
pub use sampling::{DEFAULT_SEED, LogitsSampler, SamplerStage, SamplingParams};
pub use stop::{StopEvaluator, StopPolicy};
pub use types::{ChatMessage, Completion, FinishReason, Role, TokenId};
pub use utf8::{Utf8Tail, utf8_boundary, utf8_tail};
