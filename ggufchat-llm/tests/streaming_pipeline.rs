//! End-to-end behavior of the generation loop against the scripted backend.

use ggufchat_llm::{
    Completion, FinishReason, Fragment, GenerationRequest, Generator, LlmError, LlmResult,
    ReplayScript, STOP_MARKER, SamplingParams, ScriptedContext, StopPolicy,
};

struct Run {
    result: LlmResult<Completion>,
    chunks: Vec<String>,
    context: ScriptedContext,
}

fn stream_with(script: ReplayScript, request: &GenerationRequest) -> Run {
    let mut context = ScriptedContext::new(script);
    let mut chunks = Vec::new();
    let result = Generator::new(&mut context)
        .generate_streaming(request, &mut |chunk: &str| chunks.push(chunk.to_owned()));
    Run {
        result,
        chunks,
        context,
    }
}

fn stream(script: ReplayScript) -> Run {
    stream_with(script, &GenerationRequest::new("prompt"))
}

fn collect(script: ReplayScript) -> LlmResult<Completion> {
    let mut context = ScriptedContext::new(script);
    Generator::new(&mut context).generate(&GenerationRequest::new("prompt"))
}

fn bytes_script(fragments: &[&[u8]]) -> ReplayScript {
    ReplayScript::from_fragments(fragments.iter().map(|f| Fragment::Bytes(f.to_vec())))
}

fn expected_text(input: &[u8]) -> String {
    let marker = STOP_MARKER.as_bytes();
    let end = input
        .windows(marker.len())
        .position(|w| w == marker)
        .unwrap_or(input.len());
    String::from_utf8_lossy(&input[..end]).into_owned()
}

fn assert_stream_properties(input: &[u8], run: &Run, label: &str) {
    let completion = run.result.as_ref().unwrap();
    let emitted = run.chunks.concat();

    assert_eq!(emitted, expected_text(input), "concatenation law, {label}");
    assert_eq!(completion.text, emitted, "returned text, {label}");

    for chunk in &run.chunks {
        assert!(!chunk.is_empty(), "empty chunk, {label}");
        assert!(!chunk.contains(STOP_MARKER), "marker in chunk, {label}");
    }
    for pair in run.chunks.windows(2) {
        let joined = format!("{}{}", pair[0], pair[1]);
        assert!(!joined.contains(STOP_MARKER), "marker across chunks, {label}");
    }
    assert_eq!(run.context.live_samplers(), 0, "sampler released, {label}");
}

#[test]
fn test_every_three_way_split_keeps_stream_invariants() {
    let inputs: [&[u8]; 5] = [
        "Hello 世界<|im_end|>tail".as_bytes(),
        "plain 。text".as_bytes(),
        b"<<|im_en<|im_end|>",
        "é<|im_e".as_bytes(),
        "🦀 ok <|im_end|><|im_end|>".as_bytes(),
    ];

    for input in inputs {
        for first in 0..=input.len() {
            for second in first..=input.len() {
                let fragments = [&input[..first], &input[first..second], &input[second..]];
                let run = stream(bytes_script(&fragments));
                assert_stream_properties(input, &run, &format!("{input:?} at {first}/{second}"));
            }
        }
    }
}

#[test]
fn test_byte_at_a_time_stream() {
    let input = "Grüße, 世界! <|im_end|> after".as_bytes();
    let fragments: Vec<&[u8]> = input.chunks(1).collect();
    let run = stream(bytes_script(&fragments));
    assert_stream_properties(input, &run, "byte at a time");
    assert_eq!(
        run.result.unwrap().finish_reason,
        FinishReason::StopMarker
    );
}

#[test]
fn test_split_marker_matches_single_fragment() {
    let split = stream(ReplayScript::from_fragments(["Answer", "<|im_", "end", "|>tail"]));
    let whole = stream(ReplayScript::from_fragments(["Answer", "<|im_end|>tail"]));

    let split_completion = split.result.unwrap();
    let whole_completion = whole.result.unwrap();
    assert_eq!(split_completion.text, "Answer");
    assert_eq!(split_completion.text, whole_completion.text);
    assert_eq!(split_completion.finish_reason, FinishReason::StopMarker);
    assert_eq!(split.chunks, ["Answer"]);
    assert!(split.chunks.iter().all(|c| !c.contains("tail")));
}

#[test]
fn test_split_character_emits_once_after_last_byte() {
    let full_stop = "。".as_bytes();
    let run = stream(bytes_script(&[
        &full_stop[..1],
        &full_stop[1..2],
        &full_stop[2..],
    ]));
    assert_eq!(run.chunks, ["。"]);
    assert_eq!(run.result.unwrap().tokens_generated, 3);
}

#[test]
fn test_max_tokens_bounds_generation() {
    let script = ReplayScript::default().with_filler("a");
    let run = stream_with(script, &GenerationRequest::new("go").with_max_tokens(30));
    let completion = run.result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::Length);
    assert_eq!(completion.tokens_generated, 30);
    assert_eq!(completion.text, "a".repeat(30));
    assert_eq!(run.chunks.concat(), completion.text);
}

#[test]
fn test_token_ceiling_stops_runaway_generation() {
    let script = ReplayScript::default().with_filler("a");
    let run = stream_with(script, &GenerationRequest::new("go").with_max_tokens(1_000));
    let completion = run.result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::TokenCeiling);
    assert_eq!(completion.tokens_generated, 257);
    assert_eq!(completion.text.len(), 257);
}

#[test]
fn test_custom_policy_ceiling() {
    let mut context = ScriptedContext::new(ReplayScript::default().with_filler("z"));
    let completion = Generator::new(&mut context)
        .with_policy(StopPolicy {
            token_ceiling: 5,
            ..StopPolicy::default()
        })
        .generate(&GenerationRequest::new("go"))
        .unwrap();
    assert_eq!(completion.finish_reason, FinishReason::TokenCeiling);
    assert_eq!(completion.text, "zzzzzz");
}

fn sentence_at(position: usize) -> ReplayScript {
    let mut fragments = vec!["w"; position - 1];
    fragments.push(".");
    fragments.extend(std::iter::repeat_n("w", 20));
    ReplayScript::from_fragments(fragments)
}

#[test]
fn test_sentence_before_floor_does_not_stop() {
    let completion = stream(sentence_at(40)).result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(completion.tokens_generated, 60);
}

#[test]
fn test_sentence_inside_window_stops() {
    let completion = stream(sentence_at(70)).result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::SentenceComplete);
    assert_eq!(completion.tokens_generated, 70);
    assert!(completion.text.ends_with('.'));
}

#[test]
fn test_sentence_past_ceiling_does_not_stop() {
    let completion = stream(sentence_at(120)).result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(completion.tokens_generated, 140);
}

#[test]
fn test_end_of_generation_appends_nothing() {
    let run = stream(ReplayScript::from_fragments(["Hi", "!"]));
    let completion = run.result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(completion.text, "Hi!");
    assert_eq!(completion.tokens_generated, 2);
}

#[test]
fn test_role_switch_after_lead_in_stops() {
    let run = stream(ReplayScript::from_fragments([
        "Sure thing",
        "\n",
        "<|im_start|>",
        "user",
        "\nmore",
    ]));
    let completion = run.result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::RoleSwitch);
    assert_eq!(completion.tokens_generated, 3);
    assert_eq!(completion.text, "Sure thing\n<|im_start|>");
    assert_eq!(run.chunks.concat(), completion.text);
}

#[test]
fn test_role_switch_at_start_is_ignored() {
    let completion = stream(ReplayScript::from_fragments([
        "<|im_start|>",
        "assistant\n",
        "Hello",
    ]))
    .result
    .unwrap();
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(completion.text, "<|im_start|>assistant\nHello");
}

#[test]
fn test_tokenizer_retry_succeeds() {
    let script = ReplayScript::from_fragments(["ok"]).with_tokens_per_byte(3);
    let prompt = "x".repeat(40);
    let run = stream_with(script, &GenerationRequest::new(prompt));
    let completion = run.result.unwrap();
    assert_eq!(completion.prompt_tokens, 120);
    assert_eq!(completion.text, "ok");
}

#[test]
fn test_tokenizer_double_failure() {
    let run = stream(ReplayScript::from_fragments(["never"]).with_undersized_tokenizer());
    assert!(matches!(run.result, Err(LlmError::Tokenization(_))));
    assert!(run.chunks.is_empty());
    assert_eq!(run.context.live_samplers(), 0);
}

#[test]
fn test_empty_prompt_is_a_tokenization_failure() {
    let run = stream_with(
        ReplayScript::from_fragments(["never"]),
        &GenerationRequest::new(""),
    );
    assert!(matches!(run.result, Err(LlmError::Tokenization(_))));
    assert_eq!(run.context.live_samplers(), 0);
}

#[test]
fn test_prompt_decode_failure() {
    let run = stream(ReplayScript::from_fragments(["never"]).with_decode_failure_at(0));
    assert!(matches!(run.result, Err(LlmError::PromptDecode(_))));
    assert!(run.chunks.is_empty());
    assert_eq!(run.context.live_samplers(), 0);
}

#[test]
fn test_prompt_longer_than_context() {
    let script = ReplayScript::from_fragments(["never"]).with_context_length(4);
    let run = stream_with(script, &GenerationRequest::new("too long"));
    assert!(matches!(run.result, Err(LlmError::PromptDecode(_))));
}

#[test]
fn test_sampler_failure_is_invalid_session() {
    let run = stream(ReplayScript::from_fragments(["never"]).with_sampler_failure());
    assert!(matches!(run.result, Err(LlmError::InvalidSession(_))));
    assert_eq!(run.context.resets(), 0);
}

#[test]
fn test_mid_generation_decode_failure_keeps_partial_text() {
    let run = stream(ReplayScript::from_fragments(["a", "b", "c"]).with_decode_failure_at(2));
    let completion = run.result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::DecodeFailed);
    assert!(completion.finish_reason.is_partial());
    assert_eq!(completion.text, "ab");
    assert_eq!(run.chunks, ["a", "b"]);
    assert_eq!(run.context.live_samplers(), 0);
}

#[test]
fn test_oversized_piece_keeps_partial_text() {
    let run = stream(ReplayScript::from_fragments(["a", "b"]).with_oversized_piece_at(1));
    let completion = run.result.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::FragmentTooLong);
    assert_eq!(completion.text, "a");
    assert_eq!(run.context.live_samplers(), 0);
}

#[test]
fn test_long_piece_is_retried_not_truncated() {
    let long = "x".repeat(300);
    let run = stream(ReplayScript::from_fragments([long.as_str(), "!"]));
    let completion = run.result.unwrap();
    assert_eq!(completion.text.len(), 301);
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
}

#[test]
fn test_invalid_bytes_are_replaced_at_flush() {
    let run = stream(bytes_script(&[b"ok", &[0xFF], b"!"]));
    let completion = run.result.unwrap();
    assert_eq!(completion.text, "ok\u{FFFD}!");
    assert_eq!(run.chunks.concat(), completion.text);
}

#[test]
fn test_collect_and_stream_agree() {
    let scripts = [
        ReplayScript::from_fragments(["Hello", " <|im", "_end|>", "x"]),
        ReplayScript::from_fragments(["Sure thing", "\n", "<|im_start|>", "user"]),
        sentence_at(70),
        ReplayScript::from_fragments(["a", "b", "c"]).with_decode_failure_at(2),
        ReplayScript::default().with_filler("a"),
    ];
    for script in scripts {
        let streamed = stream(script.clone()).result.unwrap();
        let collected = collect(script).unwrap();
        assert_eq!(streamed, collected);
    }
}

fn one_hot(index: usize, len: usize) -> Vec<f32> {
    (0..len).map(|i| if i == index { 5.0 } else { 0.0 }).collect()
}

#[test]
fn test_greedy_logits_choose_fragments() {
    let rows = [1, 2, 3, 3].iter().map(|&i| one_hot(i, 4)).collect();
    let script = ReplayScript::from_fragments(["Yes", "No", ".", ""]).with_logits(rows);
    let request = GenerationRequest::new("prompt").with_sampling(SamplingParams {
        temperature: 0.0,
        ..SamplingParams::default()
    });
    let run = stream_with(script, &request);

    let completion = run.result.unwrap();
    assert_eq!(run.chunks, ["No", "."]);
    assert_eq!(completion.text, "No.");
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(completion.tokens_generated, 2);
    // Six prompt tokens plus every sampled token, empty pieces included.
    assert_eq!(run.context.position(), 10);
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let script =
        ReplayScript::from_fragments(["a", "b", "c", "d"]).with_logits(vec![vec![1.0; 4]; 20]);
    let request = GenerationRequest::new("prompt").with_sampling(SamplingParams {
        temperature: 1.0,
        top_p: 1.0,
        top_k: 0,
        seed: 7,
    });

    let first = stream_with(script.clone(), &request).result.unwrap();
    let second = stream_with(script.clone(), &request).result.unwrap();
    let mut context = ScriptedContext::new(script);
    let collected = Generator::new(&mut context).generate(&request).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, collected);
    assert_eq!(first.tokens_generated, 20);
    assert!(first.text.chars().all(|c| "abcd".contains(c)));
}
