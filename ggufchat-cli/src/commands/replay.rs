//! Replay a recorded script through the chat engine.

use std::io::{self, Write};

use anyhow::{Context, Result};
use ggufchat_harness::{ChatConfig, ChatEngine, ChatPromptBuilder, ConversationHistory};
use ggufchat_llm::{ReplayScript, ScriptedContext};
use tracing::info;

use crate::args::Args;

/// Load the configuration named on the command line, or the global one.
fn load_config(args: &Args) -> Result<ChatConfig> {
    let mut config = match &args.config {
        Some(path) => ChatConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ChatConfig::load().context("Failed to load config")?,
    };

    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = max_tokens;
    }
    if args.no_stream {
        config.streaming = false;
    }
    Ok(config)
}

/// Run every turn against a scripted context and print the replies.
pub fn run(args: &Args) -> Result<()> {
    let turns = args.turns()?;
    let script = ReplayScript::load(&args.script)
        .with_context(|| format!("Failed to load script from {}", args.script.display()))?;
    let config = load_config(args)?;

    let builder = ChatPromptBuilder::new(config.template());
    let engine = ChatEngine::new(config)?;
    engine.load(ScriptedContext::new(script))?;

    let stdout = io::stdout();
    for (index, turn) in turns.iter().enumerate() {
        if args.show_prompt {
            let mut history = ConversationHistory::new(0);
            for exchange in engine.history() {
                history.push(exchange.user, exchange.assistant);
            }
            let prompt = builder.build(&engine.config().system_prompt, &history, turn)?;
            eprintln!("--- prompt {} ---\n{}--- end prompt ---", index + 1, prompt);
        }

        let mut out = stdout.lock();
        let mut write_error = None;
        let mut sink = |chunk: &str| {
            if write_error.is_some() {
                return;
            }
            if let Err(e) = out.write_all(chunk.as_bytes()).and_then(|()| out.flush()) {
                write_error = Some(e);
            }
        };
        let reply = engine.generate(turn, Some(&mut sink))?;
        if let Some(e) = write_error {
            return Err(e).context("Failed to write to stdout");
        }

        if !engine.is_streaming() {
            out.write_all(reply.content.as_bytes())?;
        }
        writeln!(out)?;
        out.flush()?;

        info!(
            "Turn {} finished: {} ({} tokens)",
            index + 1,
            reply.finish_reason,
            reply.tokens_generated
        );
    }

    engine.release()?;
    Ok(())
}
