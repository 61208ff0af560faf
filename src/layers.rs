//! Neural network layers for the transformer forward pass
//!
//! Implements the building blocks of a Llama-3-style decoder block:
//! - `RmsNorm` - root-mean-square normalization with a learned gain
//! - `Linear` - matrix-vector projection, polymorphic over float/quantized weights
//! - `CausalAttention` - grouped-query attention with a sliding KV cache
//! - `Ffn` - SwiGLU feed-forward network
//! - `TransformerBlock` - pre-norm residual composition of the above
//!
//! Layers own their weights and scratch buffers; weights are immutable after
//! `load_weights`. Forward methods take `&mut Tensor` inputs because reading
//! an activation may lazily materialize the representation a kernel needs.

use std::io::Read;

use rayon::prelude::*;

use crate::error::{InferenciaError, Result};
use crate::kernels;
use crate::tensor::{QuantizedTensor, Tensor};

/// RMS normalization layer
///
/// `out[i] = w[i] * x[i] / sqrt(mean(x²) + 1e-5)`; no mean subtraction.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    dim: usize,
    weight: Tensor,
}

impl RmsNorm {
    /// Create a norm layer for vectors of length `dim`
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            weight: Tensor::new(dim),
        }
    }

    /// Normalize `x` into `out`
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either vector length differs from `dim`.
    pub fn forward(&mut self, x: &mut Tensor, out: &mut Tensor) -> Result<()> {
        if x.len() != self.dim || out.len() != self.dim {
            return Err(InferenciaError::ShapeMismatch {
                expected: self.dim,
                actual: if x.len() == self.dim { out.len() } else { x.len() },
            });
        }

        let wf = self.weight.float()?;
        let xf = x.float()?;
        kernels::rms_norm(out.float_mut()?, xf, wf);
        Ok(())
    }

    /// Read the gain vector from the weight stream
    ///
    /// # Errors
    ///
    /// Propagates payload read failures.
    pub fn load_weights<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        self.weight.read_from(reader)
    }
}

/// Linear projection layer
///
/// Holds a weight tensor of logical size `in_dim * out_dim`, row-major with
/// row `i` producing `out[i]`. The forward pass dispatches on the weight's
/// representation: a quantized weight requests the input quantized at the
/// same group size and runs the integer kernel; a float weight runs the
/// float kernel.
#[derive(Debug, Clone)]
pub struct Linear {
    in_dim: usize,
    out_dim: usize,
    weight: Tensor,
}

impl Linear {
    /// Create a projection from `in_dim` to `out_dim`
    #[must_use]
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        Self {
            in_dim,
            out_dim,
            weight: Tensor::new(in_dim * out_dim),
        }
    }

    /// Project `x` into `out`
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` on input/output length mismatch
    /// - quantization errors from materializing the input's quantized form
    pub fn forward(&mut self, x: &mut Tensor, out: &mut Tensor) -> Result<()> {
        if x.len() != self.in_dim {
            return Err(InferenciaError::ShapeMismatch {
                expected: self.in_dim,
                actual: x.len(),
            });
        }
        if out.len() != self.out_dim {
            return Err(InferenciaError::ShapeMismatch {
                expected: self.out_dim,
                actual: out.len(),
            });
        }

        if self.weight.is_quant_valid() {
            let group_size = self.weight.quant()?.group_size;
            let xq = x.quant_with(group_size)?;
            kernels::matmul_quantized(out.float_mut()?, xq, self.weight.quant()?);
        } else {
            let xf = x.float()?;
            let wf = self.weight.float()?;
            kernels::matmul_float(out.float_mut()?, xf, wf);
        }
        Ok(())
    }

    /// Read the weight tensor from the weight stream
    ///
    /// # Errors
    ///
    /// Propagates payload read failures.
    pub fn load_weights<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        self.weight.read_from(reader)
    }

    /// Overwrite the weight with a float payload
    pub fn set_weights_float(&mut self, data: Vec<f32>) {
        self.weight.assign_float(data);
    }

    /// Overwrite the weight with a quantized payload
    pub fn set_weights_quant(&mut self, qt: QuantizedTensor) {
        self.weight.assign_quant(qt);
    }

    /// Overwrite the weight with another tensor's payloads and state
    pub fn set_weights(&mut self, w: &Tensor) {
        self.weight.assign(w);
    }
}

/// Grouped-query causal attention with a sliding-window KV cache
///
/// One KV head serves `n_heads / n_kv_heads` query heads. The cache holds
/// `seq_length` key and value slots; when full, the slots shift left by one
/// and the cursor reuses the last index, so generation past `seq_length`
/// degrades to a rolling window instead of erroring. Retained entries keep
/// the rotary phase of the absolute position they were written at.
#[derive(Debug, Clone)]
pub struct CausalAttention {
    pos: usize,
    dim: usize,
    n_heads: usize,
    n_kv_heads: usize,

    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,

    query: Tensor,
    key_cache: Vec<Tensor>,
    value_cache: Vec<Tensor>,

    /// Per-head attention-score scratch, each of length `seq_length`
    att: Vec<Vec<f32>>,
    xb: Tensor,
}

impl CausalAttention {
    /// Create an attention layer sized for `seq_length` positions
    #[must_use]
    pub fn new(seq_length: usize, dim: usize, n_heads: usize, n_kv_heads: usize) -> Self {
        let kv_dim = dim * n_kv_heads / n_heads;
        Self {
            pos: 0,
            dim,
            n_heads,
            n_kv_heads,
            wq: Linear::new(dim, dim),
            wk: Linear::new(dim, kv_dim),
            wv: Linear::new(dim, kv_dim),
            wo: Linear::new(dim, dim),
            query: Tensor::zeros(dim),
            key_cache: vec![Tensor::zeros(kv_dim); seq_length],
            value_cache: vec![Tensor::zeros(kv_dim); seq_length],
            att: vec![vec![0.0; seq_length]; n_heads],
            xb: Tensor::zeros(dim),
        }
    }

    /// Next cache slot to write (also the number of filled slots while the
    /// window is not yet full)
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Attend over the cached positions and the current one
    ///
    /// # Errors
    ///
    /// Propagates projection shape errors and representation failures.
    pub fn forward(&mut self, x: &mut Tensor, out: &mut Tensor) -> Result<()> {
        let seq_length = self.key_cache.len();

        // Window full: drop the oldest entry and reuse the tail slot. The
        // rotated-out tensor lands at the end and is overwritten below.
        if self.pos == seq_length {
            self.key_cache.rotate_left(1);
            self.value_cache.rotate_left(1);
            self.pos = seq_length - 1;
        }
        let pos = self.pos;

        self.wq.forward(x, &mut self.query)?;
        self.wk.forward(x, &mut self.key_cache[pos])?;
        self.wv.forward(x, &mut self.value_cache[pos])?;

        let head_size = self.dim / self.n_heads;
        kernels::apply_rope(
            self.query.float_mut()?,
            self.key_cache[pos].float_mut()?,
            pos,
            self.n_heads,
            head_size,
            self.n_kv_heads,
        );

        let kv_mul = self.n_heads / self.n_kv_heads;
        let scale = 1.0 / (head_size as f32).sqrt();

        // Materialize float views of the filled slots before the parallel
        // region; all representation-state transitions stay on this thread.
        let q_all = self.query.float()?;
        let keys: Vec<&[f32]> = self.key_cache[..=pos]
            .iter_mut()
            .map(Tensor::float)
            .collect::<Result<_>>()?;
        let values: Vec<&[f32]> = self.value_cache[..=pos]
            .iter_mut()
            .map(Tensor::float)
            .collect::<Result<_>>()?;
        let xb_f = self.xb.float_mut()?;

        self.att
            .par_iter_mut()
            .zip(xb_f.par_chunks_mut(head_size))
            .enumerate()
            .for_each(|(h, (att_h, xb_h))| {
                let q = &q_all[h * head_size..(h + 1) * head_size];
                let kv_off = (h / kv_mul) * head_size;

                for t in 0..=pos {
                    let k = &keys[t][kv_off..kv_off + head_size];
                    let score: f32 = q.iter().zip(k.iter()).map(|(a, b)| a * b).sum();
                    att_h[t] = score * scale;
                }

                kernels::softmax(&mut att_h[..=pos]);

                xb_h.fill(0.0);
                for t in 0..=pos {
                    let v = &values[t][kv_off..kv_off + head_size];
                    let w = att_h[t];
                    for (o, &vi) in xb_h.iter_mut().zip(v.iter()) {
                        *o += w * vi;
                    }
                }
            });

        self.wo.forward(&mut self.xb, out)?;
        self.pos += 1;
        Ok(())
    }

    /// Read the four projection weights in stream order
    ///
    /// # Errors
    ///
    /// Propagates payload read failures.
    pub fn load_weights<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        self.wq.load_weights(reader)?;
        self.wk.load_weights(reader)?;
        self.wv.load_weights(reader)?;
        self.wo.load_weights(reader)
    }
}

/// SwiGLU feed-forward network
///
/// `out = w2 · (silu(w1·x) ⊙ (w3·x))`
#[derive(Debug, Clone)]
pub struct Ffn {
    w1: Linear,
    w2: Linear,
    w3: Linear,
    hb: Tensor,
    hb2: Tensor,
}

impl Ffn {
    /// Create an FFN expanding `dim` to `hidden_dim` and back
    #[must_use]
    pub fn new(dim: usize, hidden_dim: usize) -> Self {
        Self {
            w1: Linear::new(dim, hidden_dim),
            w2: Linear::new(hidden_dim, dim),
            w3: Linear::new(dim, hidden_dim),
            hb: Tensor::zeros(hidden_dim),
            hb2: Tensor::zeros(hidden_dim),
        }
    }

    /// Apply the gated feed-forward transform
    ///
    /// # Errors
    ///
    /// Propagates projection shape errors.
    pub fn forward(&mut self, x: &mut Tensor, out: &mut Tensor) -> Result<()> {
        self.w1.forward(x, &mut self.hb)?;
        self.w3.forward(x, &mut self.hb2)?;

        let gate = self.hb2.float()?;
        kernels::swiglu(self.hb.float_mut()?, gate);

        self.w2.forward(&mut self.hb, out)
    }

    /// Read `w1`, `w2`, `w3` in stream order
    ///
    /// # Errors
    ///
    /// Propagates payload read failures.
    pub fn load_weights<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        self.w1.load_weights(reader)?;
        self.w2.load_weights(reader)?;
        self.w3.load_weights(reader)
    }
}

/// One decoder block: pre-norm attention and FFN with residual adds
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    attention_norm: RmsNorm,
    attention: CausalAttention,
    ffn_norm: RmsNorm,
    ffn: Ffn,

    xb: Tensor,
    xb2: Tensor,
}

impl TransformerBlock {
    /// Create a block with all sublayers sized from the model dimensions
    #[must_use]
    pub fn new(
        seq_length: usize,
        dim: usize,
        n_heads: usize,
        n_kv_heads: usize,
        hidden_dim: usize,
    ) -> Self {
        Self {
            attention_norm: RmsNorm::new(dim),
            attention: CausalAttention::new(seq_length, dim, n_heads, n_kv_heads),
            ffn_norm: RmsNorm::new(dim),
            ffn: Ffn::new(dim, hidden_dim),
            xb: Tensor::zeros(dim),
            xb2: Tensor::zeros(dim),
        }
    }

    /// Write cursor of this block's attention cache
    #[must_use]
    pub fn attention_pos(&self) -> usize {
        self.attention.pos()
    }

    /// Run the block: norm, attention, residual, norm, FFN, residual
    ///
    /// # Errors
    ///
    /// Propagates sublayer failures.
    pub fn forward(&mut self, x: &mut Tensor, out: &mut Tensor) -> Result<()> {
        self.attention_norm.forward(x, &mut self.xb)?;
        self.attention.forward(&mut self.xb, &mut self.xb2)?;

        // residual: xb2 += x
        {
            let xf = x.float()?;
            let xb2f = self.xb2.float_mut()?;
            for (a, &b) in xb2f.iter_mut().zip(xf.iter()) {
                *a += b;
            }
        }

        self.ffn_norm.forward(&mut self.xb2, &mut self.xb)?;
        self.ffn.forward(&mut self.xb, out)?;

        // residual: out += xb2
        let xb2f = self.xb2.float()?;
        let outf = out.float_mut()?;
        for (a, &b) in outf.iter_mut().zip(xb2f.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Read the block's weights in stream order: attention norm, attention
    /// projections, FFN norm, FFN weights
    ///
    /// # Errors
    ///
    /// Propagates payload read failures.
    pub fn load_weights<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        self.attention_norm.load_weights(reader)?;
        self.attention.load_weights(reader)?;
        self.ffn_norm.load_weights(reader)?;
        self.ffn.load_weights(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::quantize;

    fn tensor_from(data: &[f32]) -> Tensor {
        let mut t = Tensor::zeros(data.len());
        t.float_mut().unwrap().copy_from_slice(data);
        t
    }

    #[test]
    fn test_rms_norm_forward() {
        let mut norm = RmsNorm::new(4);
        norm.weight = tensor_from(&[1.0, 1.0, 1.0, 1.0]);

        let mut x = tensor_from(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = Tensor::zeros(4);
        norm.forward(&mut x, &mut out).unwrap();

        let of = out.float().unwrap();
        let rms = (of.iter().map(|v| v * v).sum::<f32>() / 4.0).sqrt();
        assert!((rms - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_rms_norm_shape_mismatch() {
        let mut norm = RmsNorm::new(4);
        let mut x = Tensor::zeros(3);
        let mut out = Tensor::zeros(4);
        assert!(matches!(
            norm.forward(&mut x, &mut out),
            Err(InferenciaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_linear_forward_float() {
        let mut linear = Linear::new(3, 2);
        // rows: [1,2,3], [4,5,6]
        linear.set_weights_float(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut x = tensor_from(&[1.0, 1.0, 1.0]);
        let mut out = Tensor::zeros(2);
        linear.forward(&mut x, &mut out).unwrap();

        assert_eq!(out.float().unwrap(), &[6.0, 15.0]);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let mut linear = Linear::new(3, 2);
        let mut x = Tensor::zeros(2);
        let mut out = Tensor::zeros(2);
        let err = linear.forward(&mut x, &mut out).unwrap_err();
        assert_eq!(
            err,
            InferenciaError::ShapeMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_linear_quantized_dispatch() {
        let mut linear = Linear::new(4, 2);
        let w: Vec<f32> = vec![0.5, -0.5, 1.0, -1.0, 0.25, 0.25, -0.25, -0.25];
        linear.set_weights_quant(quantize(&w, 4).unwrap());

        let xf = [1.0, 2.0, -1.0, 0.5];
        let mut x = tensor_from(&xf);
        let mut out = Tensor::zeros(2);
        linear.forward(&mut x, &mut out).unwrap();

        // Input got quantized at the weight's group size, float stays valid
        assert_eq!(x.quant().unwrap().group_size, 4);
        assert!(x.is_float_valid());

        let mut expected = vec![0.0; 2];
        kernels::matmul_float(&mut expected, &xf, &w);
        for (a, b) in out.float().unwrap().iter().zip(expected.iter()) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_linear_requantize_refused_on_mismatched_input() {
        let mut linear = Linear::new(4, 2);
        linear.set_weights_quant(quantize(&[0.5; 8], 4).unwrap());

        let mut x = tensor_from(&[1.0, 2.0, 3.0, 4.0]);
        // Pre-quantize the input at an incompatible group size
        x.quant_mut(2).unwrap();

        let mut out = Tensor::zeros(2);
        assert!(matches!(
            linear.forward(&mut x, &mut out),
            Err(InferenciaError::ReQuantizeRefused { .. })
        ));
    }

    #[test]
    fn test_ffn_forward_shapes() {
        let mut ffn = Ffn::new(2, 4);
        ffn.w1.set_weights_float(vec![0.1; 8]);
        ffn.w2.set_weights_float(vec![0.1; 8]);
        ffn.w3.set_weights_float(vec![0.1; 8]);

        let mut x = tensor_from(&[1.0, 2.0]);
        let mut out = Tensor::zeros(2);
        ffn.forward(&mut x, &mut out).unwrap();

        for v in out.float().unwrap() {
            assert!(v.is_finite());
        }
    }

    fn identity_attention(seq_length: usize) -> CausalAttention {
        // dim=4, 2 query heads, 1 kv head -> kv_dim = 2
        let mut att = CausalAttention::new(seq_length, 4, 2, 1);
        let mut wq = vec![0.0; 16];
        for i in 0..4 {
            wq[i * 4 + i] = 1.0;
        }
        att.wq.set_weights_float(wq.clone());
        att.wo.set_weights_float(wq);
        // kv projections take the first two input lanes
        let mut wk = vec![0.0; 8];
        wk[0] = 1.0;
        wk[4 + 1] = 1.0;
        att.wk.set_weights_float(wk.clone());
        att.wv.set_weights_float(wk);
        att
    }

    #[test]
    fn test_attention_single_step() {
        let mut att = identity_attention(8);
        let mut x = tensor_from(&[1.0, 0.5, -0.5, 0.25]);
        let mut out = Tensor::zeros(4);

        att.forward(&mut x, &mut out).unwrap();
        assert_eq!(att.pos(), 1);

        // With one cached position the attention weight is 1, so the output
        // is wo applied to the value vector broadcast across heads.
        let of = out.float().unwrap();
        assert!((of[0] - 1.0).abs() < 1e-5);
        assert!((of[1] - 0.5).abs() < 1e-5);
        assert!((of[2] - 1.0).abs() < 1e-5);
        assert!((of[3] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_attention_window_shift() {
        let seq_length = 4;
        let mut att = identity_attention(seq_length);
        let mut out = Tensor::zeros(4);

        for step in 0..10 {
            let v = step as f32;
            let mut x = tensor_from(&[v, -v, 0.0, 0.0]);
            att.forward(&mut x, &mut out).unwrap();
        }

        // Window stays full; cursor sits one past the last written slot.
        assert_eq!(att.pos(), seq_length);

        // After 10 steps the oldest retained value row comes from step 6:
        // steps 0..=3 fill the window, each later step drops one.
        let oldest = att.value_cache[0].float().unwrap();
        assert!((oldest[0] - 6.0).abs() < 1e-5);
        assert!((oldest[1] + 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_attention_scores_only_over_filled_positions() {
        let mut att = identity_attention(8);
        let mut out = Tensor::zeros(4);

        let mut x = tensor_from(&[1.0, 1.0, 0.0, 0.0]);
        att.forward(&mut x, &mut out).unwrap();
        let mut x = tensor_from(&[1.0, 1.0, 0.0, 0.0]);
        att.forward(&mut x, &mut out).unwrap();

        // Softmax ran over positions 0..=1 only
        let att_row = &att.att[0];
        assert!((att_row[0] + att_row[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_block_forward_residual() {
        let mut block = TransformerBlock::new(4, 4, 2, 1, 8);
        // Zero weights everywhere: attention and ffn outputs are zero, so
        // the block reduces to the two residual adds and out == x.
        block.attention_norm.weight = tensor_from(&[0.0; 4]);
        block.ffn_norm.weight = tensor_from(&[0.0; 4]);
        block.attention.wq.set_weights_float(vec![0.0; 16]);
        block.attention.wk.set_weights_float(vec![0.0; 8]);
        block.attention.wv.set_weights_float(vec![0.0; 8]);
        block.attention.wo.set_weights_float(vec![0.0; 16]);
        block.ffn.w1.set_weights_float(vec![0.0; 32]);
        block.ffn.w2.set_weights_float(vec![0.0; 32]);
        block.ffn.w3.set_weights_float(vec![0.0; 32]);

        let mut x = tensor_from(&[1.0, -2.0, 3.0, -4.0]);
        let mut out = Tensor::zeros(4);
        block.forward(&mut x, &mut out).unwrap();

        assert_eq!(out.float().unwrap(), &[1.0, -2.0, 3.0, -4.0]);
    }
}
