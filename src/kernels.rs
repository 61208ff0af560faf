//! Pure compute kernels
//!
//! Hot-path functions for the transformer forward pass:
//! - Float and quantized matrix-vector products
//! - RMS normalization
//! - Rotary position embeddings (`RoPE`)
//! - Softmax
//! - SwiGLU gating
//!
//! The two matmuls are the only kernels worth parallelizing: output rows are
//! independent, so they are dispatched across the rayon pool with disjoint
//! output slots and shared immutable inputs. Everything else is O(dim) per
//! token and runs on the driver thread.

use rayon::prelude::*;

use crate::tensor::QuantizedTensor;

/// RoPE base frequency for Llama-3 models
const ROPE_THETA: f32 = 500_000.0;

/// Float matrix-vector product: `out[i] = Σ_j x[j] * w[i*n + j]`
///
/// `w` is row-major `(out.len(), x.len())`, row `i` holding the weights
/// that produce `out[i]`.
pub fn matmul_float(out: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let row = &w[i * n..(i + 1) * n];
        *o = x.iter().zip(row.iter()).map(|(a, b)| a * b).sum();
    });
}

/// Quantized matrix-vector product over int8 payloads with shared group size
///
/// For each output row the inner product runs group-by-group: int8 products
/// accumulate in `i32` (wide enough that a full group cannot overflow), and
/// each group's integer sum is scaled by the weight-group and input-group
/// scales.
///
/// By far the most time of a quantized forward pass is spent here.
pub fn matmul_quantized(out: &mut [f32], x: &QuantizedTensor, w: &QuantizedTensor) {
    let gs = x.group_size as usize;
    let n = x.q.len();

    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let row = i * n;
        let mut val = 0.0f32;

        let mut j = 0;
        while j + gs <= n {
            let mut ival = 0i32;
            for l in 0..gs {
                ival += i32::from(x.q[j + l]) * i32::from(w.q[row + j + l]);
            }
            val += ival as f32 * w.s[(row + j) / gs] * x.s[j / gs];
            j += gs;
        }

        *o = val;
    });
}

/// RMS normalization: `out[i] = w[i] * x[i] / sqrt(Σx²/dim + 1e-5)`
///
/// No mean subtraction; the learned gain `w` is applied after scaling.
pub fn rms_norm(out: &mut [f32], x: &[f32], weight: &[f32]) {
    let dim = x.len();
    let ss: f32 = x.iter().map(|v| v * v).sum();
    let inv = 1.0 / (ss / dim as f32 + 1e-5).sqrt();

    for ((o, &xi), &wi) in out.iter_mut().zip(x.iter()).zip(weight.iter()) {
        *o = wi * (inv * xi);
    }
}

/// In-place softmax with max subtraction for numerical stability
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }

    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// SwiGLU gate: `hb[i] = silu(hb[i]) * hb2[i]` with `silu(x) = x / (1 + e^-x)`
pub fn swiglu(hb: &mut [f32], hb2: &[f32]) {
    for (h, &g) in hb.iter_mut().zip(hb2.iter()) {
        let val = *h;
        *h = val * (1.0 / (1.0 + (-val).exp())) * g;
    }
}

/// Apply rotary position embeddings to query and key vectors in-place
///
/// For each head and each even lane `j` within `head_size`, the pair
/// `(v[j], v[j+1])` rotates by `pos / 500000^(j/head_size)`. The key vector
/// only carries `n_kv_heads` heads, so it is rotated for heads below that
/// count (grouped-query attention shares each key head across several query
/// heads).
pub fn apply_rope(
    q: &mut [f32],
    k: &mut [f32],
    pos: usize,
    n_heads: usize,
    head_size: usize,
    n_kv_heads: usize,
) {
    for h in 0..n_heads {
        for j in (0..head_size).step_by(2) {
            let freq = 1.0 / ROPE_THETA.powf(j as f32 / head_size as f32);
            let angle = pos as f32 * freq;
            let (sin_v, cos_v) = angle.sin_cos();

            let idx = h * head_size + j;
            let q0 = q[idx];
            let q1 = q[idx + 1];
            q[idx] = q0 * cos_v - q1 * sin_v;
            q[idx + 1] = q0 * sin_v + q1 * cos_v;

            if h < n_kv_heads {
                let k0 = k[idx];
                let k1 = k[idx + 1];
                k[idx] = k0 * cos_v - k1 * sin_v;
                k[idx + 1] = k0 * sin_v + k1 * cos_v;
            }
        }
    }
}
