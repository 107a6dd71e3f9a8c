//! ggufchat CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod args;
mod commands;

use args::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout carries the reply, so logs go to stderr.
    let env_filter = EnvFilter::from_default_env()
        .add_directive("ggufchat=info".parse()?)
        .add_directive("warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    commands::replay::run(&args)
}
