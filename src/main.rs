//! Inferencia CLI - CPU inference for Llama-3-style transformers
//!
//! Loads a checkpoint and tokenizer artifact, then runs the generate or
//! chat loop. All diagnostics go to stderr through `tracing`; generated
//! text streams to stdout.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use inferencia::cli::{run, Args};

fn main() {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
