//! Generation driver loops
//!
//! The outer loops are sequential: encode a prompt, then one forward pass
//! per token, forcing queued prompt tokens before sampling free-running
//! ones. Decoded pieces stream to the output as they arrive.
//!
//! Chat mode is a thin scripted driver over the same core: it replays the
//! Llama-3 chat header token ids around line-wise stdin turns and streams
//! the assistant's pieces. The turn bookkeeping lives entirely in this
//! module; the transformer and sampler see nothing but tokens.

use std::io::{BufRead, Write};
use std::time::Instant;

use tracing::{debug, trace};

use crate::error::{InferenciaError, Result};
use crate::model::Transformer;
use crate::sampler::Sampler;
use crate::tensor::Tensor;
use crate::tokenizer::{
    TokenQueue, Tokenizer, BOS, DOUBLE_NEWLINE, END_HEADER, END_OF_TURN, EOT, ROLE_ASSISTANT,
    ROLE_SYSTEM, ROLE_USER, START_HEADER,
};

/// True for the token ids that terminate free-running generation
fn is_stop_token(token: u32) -> bool {
    token == EOT || token == END_OF_TURN
}

/// Autoregressive generation from a text prompt, streaming to `out`
///
/// The prompt is encoded with a leading BOS. Each iteration forwards the
/// current token; while prompt tokens remain queued the next one is forced,
/// afterwards the sampler picks it. Generation stops after `num_steps`
/// tokens (zero means unbounded) or when a sampled stop token arrives with
/// the prompt drained.
///
/// # Errors
///
/// - `EmptyPrompt` when encoding produced no tokens
/// - forward-pass and output failures
pub fn generate_to<W: Write>(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    num_steps: usize,
    out: &mut W,
) -> Result<()> {
    let mut prompt_tokens = tokenizer.encode(prompt, true, false);
    if prompt_tokens.is_empty() {
        return Err(InferenciaError::EmptyPrompt);
    }
    debug!(prompt_tokens = prompt_tokens.len(), "generation start");

    let mut logits = Tensor::zeros(transformer.config().vocab_size);
    let mut token = prompt_tokens.pop_front().unwrap_or(EOT);

    // The timer starts after the first iteration; the first forward pass
    // pays one-time costs that would skew the rate.
    let mut start: Option<Instant> = None;
    let mut steps = 0usize;

    while num_steps == 0 || steps < num_steps {
        transformer.forward(token, &mut logits)?;

        token = match prompt_tokens.pop_front() {
            Some(forced) => forced,
            None => sampler.sample(logits.float()?) as u32,
        };

        if is_stop_token(token) && prompt_tokens.is_empty() {
            break;
        }
        trace!(step = steps, token, "decode step");

        if let Some(piece) = tokenizer.decode(token) {
            out.write_all(piece.as_bytes())?;
            out.flush()?;
        }

        if start.is_none() {
            start = Some(Instant::now());
        }
        steps += 1;
    }
    writeln!(out)?;

    if let Some(start) = start {
        let elapsed = start.elapsed().as_millis();
        if elapsed > 0 && steps > 1 {
            let rate = (steps - 1) as f64 / elapsed as f64 * 1000.0;
            writeln!(out, "achieved tok/s: {rate}")?;
        }
    }
    debug!(steps, "generation end");
    Ok(())
}

/// [`generate_to`] wired to standard output
///
/// # Errors
///
/// See [`generate_to`].
pub fn generate(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    num_steps: usize,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    generate_to(transformer, tokenizer, sampler, prompt, num_steps, &mut stdout)
}

/// Queue the scripted Llama-3 chat header for a role piece
///
/// `<|start_header_id|>` role `<|end_header_id|>` `"\n\n"`
fn push_header(tokens: &mut TokenQueue, role: u32) {
    tokens.extend([START_HEADER, role, END_HEADER, DOUBLE_NEWLINE]);
}

/// Interactive chat over line-wise input, streaming assistant pieces to `out`
///
/// User turns (even turns) queue the scripted chat header tokens around the
/// encoded stdin line; the first turn additionally carries the system
/// prompt. Assistant turns run the sampler until an end-of-turn token flips
/// the turn back. An empty `system_prompt` is asked for interactively.
///
/// # Errors
///
/// Propagates forward-pass and I/O failures.
pub fn chat_io<R: BufRead, W: Write>(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    system_prompt: &str,
    num_steps: usize,
    input: &mut R,
    out: &mut W,
) -> Result<()> {
    let mut system_prompt = system_prompt.to_string();
    if system_prompt.is_empty() {
        write!(out, "Enter system prompt (optional): ")?;
        out.flush()?;
        match read_line(input)? {
            Some(line) => system_prompt = line,
            None => return Ok(()),
        }
    }

    let mut prompt_tokens = TokenQueue::new();
    let mut logits = Tensor::zeros(transformer.config().vocab_size);

    // User contributes tokens in even turns, the assistant in odd ones
    let mut turn = 0u64;
    let mut steps = 0usize;
    let mut token = 0u32;

    while num_steps == 0 || steps < num_steps {
        if turn % 2 == 0 {
            if turn == 0 {
                prompt_tokens.push_back(BOS);
                push_header(&mut prompt_tokens, ROLE_SYSTEM);
                if !system_prompt.is_empty() {
                    prompt_tokens.extend(tokenizer.encode(&system_prompt, false, false));
                }
                prompt_tokens.push_back(END_OF_TURN);
            }

            push_header(&mut prompt_tokens, ROLE_USER);

            write!(out, "User (or exit): ")?;
            out.flush()?;
            let Some(user_prompt) = read_line(input)? else {
                break;
            };
            prompt_tokens.extend(tokenizer.encode(&user_prompt, false, false));

            prompt_tokens.push_back(END_OF_TURN);
            push_header(&mut prompt_tokens, ROLE_ASSISTANT);

            turn += 1;
            write!(out, "Assistant: ")?;
            out.flush()?;
        }

        if let Some(forced) = prompt_tokens.pop_front() {
            token = forced;
        }

        // A stop token with the queue drained ends the assistant's turn
        if prompt_tokens.is_empty() && is_stop_token(token) {
            turn += 1;
        }

        transformer.forward(token, &mut logits)?;
        token = sampler.sample(logits.float()?) as u32;

        if prompt_tokens.is_empty() && !is_stop_token(token) && token != START_HEADER {
            if let Some(piece) = tokenizer.decode(token) {
                out.write_all(piece.as_bytes())?;
                out.flush()?;
            }
        }
        if (prompt_tokens.is_empty() && token == END_OF_TURN) || token == EOT {
            writeln!(out)?;
        }

        steps += 1;
    }
    writeln!(out)?;
    Ok(())
}

/// [`chat_io`] wired to standard input/output
///
/// # Errors
///
/// See [`chat_io`].
pub fn chat(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    system_prompt: &str,
    num_steps: usize,
) -> Result<()> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut stdout = std::io::stdout();
    chat_io(
        transformer,
        tokenizer,
        sampler,
        system_prompt,
        num_steps,
        &mut input,
        &mut stdout,
    )
}

/// Read one line, trimming the newline; `None` on end of input
fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let read = input.read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}
