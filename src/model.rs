//! Model configuration and the transformer stack
//!
//! `Config` mirrors the packed header of an ak42 checkpoint and is validated
//! against the model invariants before any weight is read. `Transformer`
//! owns the token embedding table, the decoder blocks, the final norm and
//! the classifier head, plus the two activation buffers the blocks ping-pong
//! between.

use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InferenciaError, Result};
use crate::layers::{Linear, RmsNorm, TransformerBlock};
use crate::tensor::{read_i32, Tensor};

/// Model hyperparameters, fixed for a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Transformer dimension
    pub dim: usize,
    /// FFN hidden dimension
    pub hidden_dim: usize,
    /// Number of decoder blocks
    pub n_layers: usize,
    /// Number of query heads
    pub n_heads: usize,
    /// Number of key/value heads (≤ `n_heads`, grouped-query attention)
    pub n_kv_heads: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (KV window size)
    pub seq_length: usize,
    /// Classifier reuses the token embedding table
    pub shared_classifier: bool,
}

impl Config {
    /// Per-head feature size
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Check the model invariants
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a field is zero, `dim` is not divisible
    /// by `n_heads`, `n_heads` is not divisible by `n_kv_heads`, or the head
    /// size is odd (rotary encoding rotates feature pairs).
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_length", self.seq_length),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(InferenciaError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.dim % self.n_heads != 0 {
            return Err(InferenciaError::InvalidConfig {
                reason: format!("dim {} not divisible by n_heads {}", self.dim, self.n_heads),
            });
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(InferenciaError::InvalidConfig {
                reason: format!(
                    "n_heads {} not divisible by n_kv_heads {}",
                    self.n_heads, self.n_kv_heads
                ),
            });
        }
        if self.head_size() % 2 != 0 {
            return Err(InferenciaError::InvalidConfig {
                reason: format!("head size {} must be even for rotary encoding", self.head_size()),
            });
        }
        Ok(())
    }

    /// Read the packed header fields: seven little-endian `i32` values, the
    /// shared-classifier byte, and three padding bytes
    ///
    /// # Errors
    ///
    /// Returns `Io` on short reads and `InvalidConfig` on nonpositive fields.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        fn field<R: Read>(name: &str, reader: &mut R) -> Result<usize> {
            let raw = read_i32(reader)?;
            usize::try_from(raw).map_err(|_| InferenciaError::InvalidConfig {
                reason: format!("{name} must be positive, got {raw}"),
            })
        }

        let dim = field("dim", reader)?;
        let hidden_dim = field("hidden_dim", reader)?;
        let n_layers = field("n_layers", reader)?;
        let n_heads = field("n_heads", reader)?;
        let n_kv_heads = field("n_kv_heads", reader)?;
        let vocab_size = field("vocab_size", reader)?;
        let seq_length = field("seq_length", reader)?;

        let mut tail = [0u8; 4];
        reader.read_exact(&mut tail)?;

        Ok(Self {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            seq_length,
            shared_classifier: tail[0] != 0,
        })
    }
}

/// Llama-3-style decoder-only transformer
///
/// The embedding table always lives in float32; the classifier may share it,
/// in whatever representation the checkpoint stored it.
#[derive(Debug)]
pub struct Transformer {
    config: Config,
    /// `(vocab_size, dim)` row-major embedding rows
    token_embedding: Vec<f32>,
    blocks: Vec<TransformerBlock>,
    final_norm: RmsNorm,
    classifier: Linear,
    /// Ping-pong activation buffers, alternated between blocks by index
    bufs: [Tensor; 2],
}

impl Transformer {
    /// Allocate a transformer for a validated config
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the config violates a model invariant.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        debug!(
            dim = config.dim,
            hidden_dim = config.hidden_dim,
            n_layers = config.n_layers,
            n_heads = config.n_heads,
            n_kv_heads = config.n_kv_heads,
            vocab_size = config.vocab_size,
            seq_length = config.seq_length,
            shared_classifier = config.shared_classifier,
            "transformer config"
        );

        let blocks = (0..config.n_layers)
            .map(|_| {
                TransformerBlock::new(
                    config.seq_length,
                    config.dim,
                    config.n_heads,
                    config.n_kv_heads,
                    config.hidden_dim,
                )
            })
            .collect();

        Ok(Self {
            token_embedding: vec![0.0; config.vocab_size * config.dim],
            blocks,
            final_norm: RmsNorm::new(config.dim),
            classifier: Linear::new(config.dim, config.vocab_size),
            bufs: [Tensor::zeros(config.dim), Tensor::zeros(config.dim)],
            config,
        })
    }

    /// Model configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decoder blocks, in forward order
    #[must_use]
    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }

    /// Consume the weight stream in checkpoint order
    ///
    /// Order: token embedding table; per block the attention norm, `wq`,
    /// `wk`, `wv`, `wo`, FFN norm, `w1`, `w2`, `w3`; the final norm; then
    /// the classifier weight iff the checkpoint does not share it with the
    /// embedding. A shared classifier adopts the embedding tensor in the
    /// representation the file used.
    ///
    /// # Errors
    ///
    /// Propagates read failures and payload shape violations.
    pub fn load_weights<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        // The embedding might double as the classifier weight, so read it as
        // a Tensor first: the forward path always wants float rows, but a
        // shared classifier keeps whatever representation the file stored.
        let mut tet = Tensor::new(self.config.vocab_size * self.config.dim);
        tet.read_from(reader)?;
        self.token_embedding = tet.float()?.to_vec();

        for block in &mut self.blocks {
            block.load_weights(reader)?;
        }

        self.final_norm.load_weights(reader)?;

        if self.config.shared_classifier {
            if tet.is_quant_valid() {
                self.classifier.set_weights_quant(tet.quant()?.clone());
            } else {
                self.classifier.set_weights_float(self.token_embedding.clone());
            }
        } else {
            self.classifier.load_weights(reader)?;
        }
        Ok(())
    }

    /// One decoding step: embed `token`, run the block stack, write logits
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` when `token` is outside the vocabulary
    /// - `ShapeMismatch` when `logits` is not `vocab_size` long
    /// - sublayer failures
    pub fn forward(&mut self, token: u32, logits: &mut Tensor) -> Result<()> {
        let dim = self.config.dim;
        let token = token as usize;
        if token >= self.config.vocab_size {
            return Err(InferenciaError::InvalidConfig {
                reason: format!(
                    "token id {token} out of range for vocab size {}",
                    self.config.vocab_size
                ),
            });
        }

        self.bufs[0]
            .float_mut()?
            .copy_from_slice(&self.token_embedding[token * dim..(token + 1) * dim]);

        // Each block reads one buffer and writes the other; swapping the
        // roles by index avoids copying activations between layers.
        let mut cur = 0;
        for block in &mut self.blocks {
            let (left, right) = self.bufs.split_at_mut(1);
            let (x, out) = if cur == 0 {
                (&mut left[0], &mut right[0])
            } else {
                (&mut right[0], &mut left[0])
            };
            block.forward(x, out)?;
            cur = 1 - cur;
        }

        let (left, right) = self.bufs.split_at_mut(1);
        let (x, out) = if cur == 0 {
            (&mut left[0], &mut right[0])
        } else {
            (&mut right[0], &mut left[0])
        };
        self.final_norm.forward(x, out)?;
        self.classifier.forward(out, logits)
    }
}
