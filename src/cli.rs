//! Command-line interface
//!
//! Argument parsing and the run-mode dispatch, kept out of `main.rs` for
//! testability.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::debug;

use crate::checkpoint::load_transformer;
use crate::error::{InferenciaError, Result};
use crate::generate::{chat, generate};
use crate::sampler::Sampler;
use crate::tokenizer::Tokenizer;

/// CPU inference for Llama-3-style transformers
#[derive(Parser, Debug)]
#[command(name = "inferencia", version, about, long_about = None)]
pub struct Args {
    /// Model checkpoint path
    pub checkpoint: PathBuf,

    /// Temperature in [0, inf]
    #[arg(short = 't', long, default_value_t = 1.0)]
    pub temperature: f32,

    /// p value in top-p (nucleus) sampling in [0, 1]
    #[arg(short = 'p', long, default_value_t = 0.9)]
    pub top_p: f32,

    /// Random seed; defaults to the current unix time
    #[arg(short = 's', long)]
    pub seed: Option<u64>,

    /// Number of steps to run for, 0 = unbounded
    #[arg(short = 'n', long, default_value_t = 128)]
    pub steps: usize,

    /// Input prompt
    #[arg(short = 'i', long, default_value = "")]
    pub prompt: String,

    /// Path to the tokenizer artifact
    #[arg(short = 'z', long, default_value = "tokenizer.bin")]
    pub tokenizer: PathBuf,

    /// Run mode: generate|chat
    #[arg(short = 'm', long, default_value = "generate")]
    pub mode: String,

    /// System prompt in chat mode
    #[arg(short = 'y', long, default_value = "")]
    pub system_prompt: String,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,
}

impl Args {
    /// Resolve the RNG seed, falling back to the wall clock
    #[must_use]
    pub fn resolved_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(1)
        })
    }
}

/// Load the model and tokenizer, build the sampler, and run the requested mode
///
/// # Errors
///
/// - `UnknownMode` for any mode other than `generate` or `chat`
/// - load and generation failures
pub fn run(args: &Args) -> Result<()> {
    if args.mode != "generate" && args.mode != "chat" {
        return Err(InferenciaError::UnknownMode {
            mode: args.mode.clone(),
        });
    }

    let mut transformer = load_transformer(&args.checkpoint)?;
    let config = transformer.config().clone();

    let tokenizer = Tokenizer::from_file(&args.tokenizer, config.vocab_size)?;

    let seed = args.resolved_seed();
    debug!(seed, temperature = args.temperature, top_p = args.top_p, "sampler");
    let mut sampler = Sampler::nucleus(config.vocab_size, args.temperature, args.top_p, seed);

    match args.mode.as_str() {
        "generate" => generate(
            &mut transformer,
            &tokenizer,
            &mut sampler,
            &args.prompt,
            args.steps,
        ),
        _ => chat(
            &mut transformer,
            &tokenizer,
            &mut sampler,
            &args.system_prompt,
            args.steps,
        ),
    }
}
