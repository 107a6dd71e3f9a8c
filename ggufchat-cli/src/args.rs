//! Command-line argument parsing.

use std::io::{self, BufRead, IsTerminal};
use std::path::PathBuf;

use clap::Parser;

/// Replay a recorded fragment script through the ggufchat chat pipeline
#[derive(Parser, Debug)]
#[command(name = "ggufchat")]
#[command(version)]
#[command(about = "Replay recorded token fragments through the ggufchat streaming pipeline")]
#[command(long_about = None)]
pub struct Args {
    /// JSON replay script describing the fragments each turn produces
    #[arg(long, value_name = "PATH")]
    pub script: PathBuf,

    /// User message for one turn. Repeat for a multi-turn conversation.
    /// Without it, each non-empty line of stdin is one turn.
    #[arg(short = 'p', long = "prompt", value_name = "TEXT")]
    pub prompts: Vec<String>,

    /// Load settings from this TOML file instead of ~/.ggufchat/config.toml
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the configured maximum number of generated tokens
    #[arg(long, value_name = "N")]
    pub max_tokens: Option<usize>,

    /// Print each reply once it is complete instead of streaming it
    #[arg(long)]
    pub no_stream: bool,

    /// Print the rendered prompt before each reply
    #[arg(long)]
    pub show_prompt: bool,
}

impl Args {
    /// Get the turns from arguments or stdin.
    pub fn turns(&self) -> anyhow::Result<Vec<String>> {
        if !self.prompts.is_empty() {
            return Ok(self.prompts.clone());
        }

        let stdin = io::stdin();
        if stdin.is_terminal() {
            anyhow::bail!("No prompt provided: pass -p/--prompt or pipe turns on stdin");
        }

        let mut turns = Vec::new();
        for line in stdin.lock().lines() {
            let line = line?;
            let line = line.trim();
            if !line.is_empty() {
                turns.push(line.to_string());
            }
        }
        if turns.is_empty() {
            anyhow::bail!("No prompt provided on stdin");
        }
        Ok(turns)
    }
}
