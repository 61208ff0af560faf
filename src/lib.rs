//! # Inferencia
//!
//! Pure Rust CPU inference engine for Llama-3-style decoder-only
//! transformers.
//!
//! Given a serialized model checkpoint (weights, optionally group-quantized
//! to int8) and a BPE tokenizer artifact, Inferencia performs autoregressive
//! text generation: tokenize a prompt, run a forward pass per token while
//! maintaining a key/value cache, sample the next token, detokenize, and
//! stream output.
//!
//! ## Features
//!
//! - **Dual-representation tensors**: float32 and group-quantized int8
//!   payloads with lazy, explicit conversion
//! - **KV-cached causal attention** with grouped-query heads, rotary
//!   position encoding and a sliding window past the sequence limit
//! - **Byte-level BPE** with byte fallback and greedy best-merge encoding
//! - **Greedy, temperature and nucleus (top-p) sampling**, reproducible
//!   from a seed
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use inferencia::checkpoint::load_transformer;
//! use inferencia::generate::generate;
//! use inferencia::sampler::Sampler;
//! use inferencia::tokenizer::Tokenizer;
//!
//! # fn main() -> inferencia::Result<()> {
//! let mut transformer = load_transformer(Path::new("model.bin"))?;
//! let vocab_size = transformer.config().vocab_size;
//! let tokenizer = Tokenizer::from_file(Path::new("tokenizer.bin"), vocab_size)?;
//! let mut sampler = Sampler::nucleus(vocab_size, 1.0, 0.9, 42);
//!
//! generate(&mut transformer, &tokenizer, &mut sampler, "Once upon a time", 128)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Numeric conversions between f32/i32/usize are inherent to the kernels
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod checkpoint;
pub mod cli;
pub mod error;
pub mod generate;
pub mod kernels;
pub mod layers;
pub mod model;
pub mod sampler;
pub mod tensor;
pub mod tokenizer;

// Re-exports for convenience
pub use error::{InferenciaError, Result};
pub use model::{Config, Transformer};
pub use sampler::Sampler;
pub use tensor::Tensor;
pub use tokenizer::Tokenizer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
