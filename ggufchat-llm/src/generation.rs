//! The generation loop.
//!
//! One call runs to completion on the calling thread:
//!
//! 1. reset the context's sequence and build a sampler;
//! 2. tokenize and decode the prompt;
//! 3. sample tokens, render each to a fragment and run the stop rules;
//! 4. flush whatever the emission buffer still holds.
//!
//! The sampler is dropped when the call returns, on every path.
//! Failures before the first sample are returned as errors. Failures inside
//! the sampling loop end it early and the partial text is returned.

use tracing::{debug, warn};

use crate::backend::{BufferTooSmall, InferenceContext, TokenSampler};
use crate::emission::{Emission, EmissionBuffer, MarkerCollector};
use crate::error::{LlmError, LlmResult};
use crate::marker::MarkerMatcher;
use crate::sampling::SamplingParams;
use crate::stop::{StopEvaluator, StopPolicy};
use crate::types::{Completion, FinishReason, TokenId};

/// Initial size of the piece buffer, in bytes.
pub const PIECE_BUFFER_LEN: usize = 256;

/// Extra token slots allocated beyond the prompt's byte length.
const TOKEN_BUFFER_SLACK: usize = 32;

/// Receives text chunks as they become safe to show.
pub trait ChunkSink {
    fn send(&mut self, chunk: &str);
}

impl<F: FnMut(&str)> ChunkSink for F {
    fn send(&mut self, chunk: &str) {
        self(chunk);
    }
}

/// Parameters of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Upper bound on sampled tokens.
    pub max_tokens: usize,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 512,
            sampling: SamplingParams::default(),
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Where fragments go during the sampling loop.
enum Output<'s> {
    Streaming {
        buffer: EmissionBuffer,
        sink: &'s mut dyn ChunkSink,
    },
    Collect(MarkerCollector),
}

impl Output<'_> {
    /// Append a fragment. Returns `true` when the stop marker completed.
    fn push(&mut self, fragment: &[u8]) -> bool {
        match self {
            Self::Streaming { buffer, sink } => match buffer.feed(fragment) {
                Emission::Nothing => false,
                Emission::Chunk(text) => {
                    sink.send(&text);
                    false
                }
                Emission::ChunkThenStop(text) => {
                    if !text.is_empty() {
                        sink.send(&text);
                    }
                    true
                }
            },
            Self::Collect(collector) => collector.push(fragment),
        }
    }

    fn total(&self) -> &[u8] {
        match self {
            Self::Streaming { buffer, .. } => buffer.total(),
            Self::Collect(collector) => collector.total(),
        }
    }

    /// Flush held bytes and return the text truncated at the first marker.
    fn finish(self) -> String {
        match self {
            Self::Streaming { mut buffer, sink } => {
                if let Some(rest) = buffer.finish() {
                    sink.send(&rest);
                }
                truncate_at_marker(buffer.total())
            }
            Self::Collect(collector) => collector.text(),
        }
    }
}

fn truncate_at_marker(total: &[u8]) -> String {
    let end = MarkerMatcher::stop()
        .find_complete(total)
        .unwrap_or(total.len());
    String::from_utf8_lossy(&total[..end]).into_owned()
}

/// Drives one [`InferenceContext`] through generation calls.
pub struct Generator<'c, C: InferenceContext> {
    context: &'c mut C,
    stop: StopEvaluator,
}

impl<'c, C: InferenceContext> Generator<'c, C> {
    pub fn new(context: &'c mut C) -> Self {
        Self {
            context,
            stop: StopEvaluator::default(),
        }
    }

    /// Use `policy` instead of the default heuristic thresholds.
    #[must_use]
    pub fn with_policy(mut self, policy: StopPolicy) -> Self {
        self.stop = StopEvaluator::new(policy);
        self
    }

    /// Generate without streaming. Only the stop marker is tracked while
    /// collecting; the result is the same text a streaming call returns.
    pub fn generate(&mut self, request: &GenerationRequest) -> LlmResult<Completion> {
        self.run(request, None)
    }

    /// Generate, forwarding each safe chunk to `sink` as soon as it is ready.
    pub fn generate_streaming(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn ChunkSink,
    ) -> LlmResult<Completion> {
        self.run(request, Some(sink))
    }

    fn run(
        &mut self,
        request: &GenerationRequest,
        sink: Option<&mut dyn ChunkSink>,
    ) -> LlmResult<Completion> {
        self.stop = StopEvaluator::new(*self.stop.policy());
        let mut sampler = self.prepare(&request.sampling)?;
        let prompt_tokens = self.decode_prompt(&request.prompt)?;

        let mut output = match sink {
            Some(sink) => Output::Streaming {
                buffer: EmissionBuffer::new(),
                sink,
            },
            None => Output::Collect(MarkerCollector::new()),
        };

        let (finish_reason, tokens_generated) =
            self.sample_loop(&mut sampler, request.max_tokens, &mut output);
        let text = output.finish();

        debug!(
            "Generation finished: {} after {} tokens ({} bytes)",
            finish_reason,
            tokens_generated,
            text.len()
        );

        Ok(Completion {
            text,
            finish_reason,
            tokens_generated,
            prompt_tokens,
        })
    }

    fn prepare(&mut self, params: &SamplingParams) -> LlmResult<C::Sampler> {
        let sampler = self.context.new_sampler(params)?;
        self.context.reset_sequence();
        debug!("KV sequence cleared");
        Ok(sampler)
    }

    fn decode_prompt(&mut self, prompt: &str) -> LlmResult<usize> {
        let tokens = self.tokenize(prompt)?;
        debug!("Prompt tokenized to {} tokens", tokens.len());
        self.context
            .decode(&tokens)
            .map_err(|e| LlmError::PromptDecode(e.to_string()))?;
        debug!("Prompt decoded");
        Ok(tokens.len())
    }

    fn tokenize(&self, prompt: &str) -> LlmResult<Vec<TokenId>> {
        let mut tokens = vec![0; prompt.len() + TOKEN_BUFFER_SLACK];
        let count = match self.context.tokenize(prompt, &mut tokens) {
            Ok(count) => count,
            Err(BufferTooSmall { required }) => {
                debug!("Tokenizer needs {} slots, retrying", required);
                tokens.resize(required, 0);
                self.context.tokenize(prompt, &mut tokens).map_err(|e| {
                    LlmError::Tokenization(format!(
                        "buffer of {} tokens still too small: {e}",
                        tokens.len()
                    ))
                })?
            }
        };
        if count == 0 {
            return Err(LlmError::Tokenization("prompt produced no tokens".into()));
        }
        tokens.truncate(count);
        Ok(tokens)
    }

    fn token_piece(&self, token: TokenId, buf: &mut Vec<u8>) -> LlmResult<()> {
        buf.resize(PIECE_BUFFER_LEN, 0);
        let written = match self.context.token_to_piece(token, buf) {
            Ok(written) => written,
            Err(BufferTooSmall { required }) => {
                buf.resize(required, 0);
                self.context
                    .token_to_piece(token, buf)
                    .map_err(|e| LlmError::FragmentTooLong {
                        token,
                        required: e.required,
                    })?
            }
        };
        buf.truncate(written);
        Ok(())
    }

    /// Returns the finish reason and the number of tokens that produced text.
    fn sample_loop(
        &mut self,
        sampler: &mut C::Sampler,
        max_tokens: usize,
        output: &mut Output<'_>,
    ) -> (FinishReason, usize) {
        let mut decoded = 0;
        let mut piece = Vec::with_capacity(PIECE_BUFFER_LEN);

        for index in 0..max_tokens {
            let token = self.context.sample(sampler);
            if let Some(reason) = self
                .stop
                .check_token(self.context.is_end_of_generation(token))
            {
                debug!("End of generation token at index {}", index);
                return (reason, decoded);
            }

            if let Err(e) = self.token_piece(token, &mut piece) {
                warn!("Stopping early: {}", e);
                return (FinishReason::FragmentTooLong, decoded);
            }

            if !piece.is_empty() {
                decoded += 1;
                if output.push(&piece) {
                    debug!("Stop marker found after {} tokens", decoded);
                    return (FinishReason::StopMarker, decoded);
                }
                if let Some(reason) = self.stop.check_output(output.total(), decoded) {
                    return (reason, decoded);
                }
            }

            if let Err(e) = self.context.decode(&[token]) {
                let e = LlmError::TokenDecode {
                    index,
                    reason: e.to_string(),
                };
                warn!("Stopping early: {}", e);
                return (FinishReason::DecodeFailed, decoded);
            }
            sampler.accept(token);
        }

        debug!("Reached max_tokens ({})", max_tokens);
        (FinishReason::Length, decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedContext;

    fn stream(
        context: &mut ScriptedContext,
        request: &GenerationRequest,
    ) -> (Completion, Vec<String>) {
        let mut chunks = Vec::new();
        let completion = Generator::new(context)
            .generate_streaming(request, &mut |chunk: &str| chunks.push(chunk.to_owned()))
            .unwrap();
        (completion, chunks)
    }

    #[test]
    fn test_streams_until_end_of_generation() {
        let mut context = ScriptedContext::from_fragments(["Hel", "lo", " there"]);
        let (completion, chunks) = stream(&mut context, &GenerationRequest::new("hi"));
        assert_eq!(chunks, ["Hel", "lo", " there"]);
        assert_eq!(completion.text, "Hello there");
        assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(completion.tokens_generated, 3);
        assert_eq!(completion.prompt_tokens, 2);
        assert_eq!(context.live_samplers(), 0);
        assert_eq!(context.resets(), 1);
    }

    #[test]
    fn test_collect_matches_stream() {
        let fragments = ["Sure", ", ", "done", "<|im_", "end|>", "extra"];
        let mut streamed = ScriptedContext::from_fragments(fragments);
        let mut collected = ScriptedContext::from_fragments(fragments);
        let request = GenerationRequest::new("q");

        let (from_stream, _) = stream(&mut streamed, &request);
        let from_collect = Generator::new(&mut collected).generate(&request).unwrap();

        assert_eq!(from_stream, from_collect);
        assert_eq!(from_collect.text, "Sure, done");
        assert_eq!(from_collect.finish_reason, FinishReason::StopMarker);
    }

    #[test]
    fn test_zero_max_tokens() {
        let mut context = ScriptedContext::from_fragments(["never"]);
        let request = GenerationRequest::new("q").with_max_tokens(0);
        let (completion, chunks) = stream(&mut context, &request);
        assert!(chunks.is_empty());
        assert_eq!(completion.finish_reason, FinishReason::Length);
        assert_eq!(completion.text, "");
    }

    #[test]
    fn test_empty_pieces_are_not_counted() {
        let mut context = ScriptedContext::from_fragments(["a", "", "b"]);
        let completion = Generator::new(&mut context)
            .generate(&GenerationRequest::new("q"))
            .unwrap();
        assert_eq!(completion.text, "ab");
        assert_eq!(completion.tokens_generated, 2);
    }

    #[test]
    fn test_sampler_parameters_reach_the_context() {
        let mut context = ScriptedContext::from_fragments(["x"]);
        let sampling = SamplingParams {
            temperature: 0.2,
            top_p: 0.5,
            top_k: 8,
            seed: 11,
        };
        let mut generator = Generator::new(&mut context);
        let request = GenerationRequest::new("q").with_sampling(sampling);
        let mut sampler = generator.prepare(&request.sampling).unwrap();
        assert_eq!(sampler.params(), &sampling);
        sampler.accept(5);
        assert_eq!(sampler.accepted(), &[5u32]);
    }

    #[test]
    fn test_role_switch_is_detected_on_every_call() {
        let mut context =
            ScriptedContext::from_fragments(["Happy to help.", " <|im_start|>", "user"]);
        let mut generator = Generator::new(&mut context);
        for _ in 0..2 {
            let completion = generator.generate(&GenerationRequest::new("q")).unwrap();
            assert_eq!(completion.finish_reason, FinishReason::RoleSwitch);
            assert_eq!(completion.tokens_generated, 2);
        }
    }
}
