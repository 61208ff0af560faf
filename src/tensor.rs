//! Dual-representation tensor
//!
//! This module provides the core `Tensor` type: a size-tagged numeric buffer
//! that can hold, independently or jointly, a float32 vector and a
//! group-quantized int8 vector (payload + per-group scale).
//!
//! Representation state is explicit. Mutable access to one form invalidates
//! the other; read access materializes the missing form lazily and keeps
//! both valid. Linear layers rely on this so that an activation quantized
//! once per step can feed every quantized weight matmul in that step.
//!
//! ## Example
//!
//! ```
//! use inferencia::tensor::Tensor;
//!
//! let mut t = Tensor::zeros(64);
//! t.float_mut().unwrap()[0] = 1.5;
//!
//! // Read-only quantized view keeps the float payload valid.
//! let q = t.quant_with(32).unwrap();
//! assert_eq!(q.group_size, 32);
//! assert!(t.is_float_valid());
//! ```

use std::io::Read;

use crate::error::{InferenciaError, Result};

/// Maximum magnitude representable by a signed 8-bit quant
const Q_MAX: f32 = 127.0;

/// Group-quantized int8 payload
///
/// Each contiguous group of `group_size` values shares one float scale.
/// Invariant: `q.len()` is a multiple of `group_size`, and
/// `s.len() == q.len() / group_size`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    /// Number of consecutive values sharing one scale
    pub group_size: u32,
    /// Quantized values
    pub q: Vec<i8>,
    /// Per-group scaling factors
    pub s: Vec<f32>,
}

/// Quantize a float slice into groups of `group_size`
///
/// Per group: `scale = max(|x|) / 127`; `q[i] = round(x[i] / scale)`.
/// A group of all zeros takes a minimal non-zero scale so the division
/// stays defined.
///
/// # Errors
///
/// Returns `InvalidConfig` if `group_size` is zero or does not divide the
/// input length.
pub fn quantize(x: &[f32], group_size: u32) -> Result<QuantizedTensor> {
    let gs = group_size as usize;
    if gs == 0 || x.len() % gs != 0 {
        return Err(InferenciaError::InvalidConfig {
            reason: format!(
                "group size {group_size} does not divide tensor length {}",
                x.len()
            ),
        });
    }

    let mut q = vec![0i8; x.len()];
    let mut s = vec![0.0f32; x.len() / gs];

    for (group, chunk) in x.chunks_exact(gs).enumerate() {
        let wmax = chunk.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        let scale = if wmax > 1e-10 { wmax / Q_MAX } else { 1.0 / Q_MAX };
        s[group] = scale;

        for (i, &v) in chunk.iter().enumerate() {
            q[group * gs + i] = (v / scale).round().clamp(-128.0, Q_MAX) as i8;
        }
    }

    Ok(QuantizedTensor { group_size, q, s })
}

/// Dequantize a group-quantized payload back to float32
///
/// `x[i] = q[i] * s[i / group_size]`.
#[must_use]
pub fn dequantize(qt: &QuantizedTensor) -> Vec<f32> {
    let gs = qt.group_size as usize;
    qt.q
        .iter()
        .enumerate()
        .map(|(i, &v)| f32::from(v) * qt.s[i / gs])
        .collect()
}

/// Representation state of a [`Tensor`]
#[derive(Debug, Clone)]
enum Repr {
    /// No payload materialized yet
    Empty,
    /// Only the float32 form is valid
    FloatOnly(Vec<f32>),
    /// Only the quantized form is valid
    QuantOnly(QuantizedTensor),
    /// Both forms are valid and coherent
    Both(Vec<f32>, QuantizedTensor),
}

/// Size-tagged buffer holding a float32 and/or group-quantized int8 form
///
/// Conversions are lazy and exactly one-way per access: the first access
/// that needs the missing form materializes it from the valid one.
/// Re-quantizing with a different group size while a quantized payload is
/// valid is refused (it would silently degrade every later matmul).
#[derive(Debug, Clone)]
pub struct Tensor {
    len: usize,
    repr: Repr,
}

impl Tensor {
    /// Allocate a tensor with no payload
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            len,
            repr: Repr::Empty,
        }
    }

    /// Allocate a tensor with a zeroed float payload
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self {
            len,
            repr: Repr::FloatOnly(vec![0.0; len]),
        }
    }

    /// Logical length
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the tensor has no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when a float payload is valid
    #[must_use]
    pub fn is_float_valid(&self) -> bool {
        matches!(self.repr, Repr::FloatOnly(_) | Repr::Both(..))
    }

    /// True when a quantized payload is valid
    #[must_use]
    pub fn is_quant_valid(&self) -> bool {
        matches!(self.repr, Repr::QuantOnly(_) | Repr::Both(..))
    }

    /// Mutable float view
    ///
    /// Ensures the float form is valid (dequantizing if needed), then drops
    /// the quantized payload: the caller is about to write floats, so any
    /// quantized form would go stale.
    ///
    /// # Errors
    ///
    /// Currently infallible for well-formed tensors; returns `Result` so the
    /// access pattern matches the fallible quantized accessors.
    pub fn float_mut(&mut self) -> Result<&mut [f32]> {
        self.repr = match std::mem::replace(&mut self.repr, Repr::Empty) {
            Repr::Empty => Repr::FloatOnly(vec![0.0; self.len]),
            Repr::FloatOnly(f) => Repr::FloatOnly(f),
            Repr::QuantOnly(qt) => Repr::FloatOnly(dequantize(&qt)),
            Repr::Both(f, _) => Repr::FloatOnly(f),
        };
        match &mut self.repr {
            Repr::FloatOnly(f) => Ok(f.as_mut_slice()),
            _ => unreachable!("float_mut always leaves a float payload"),
        }
    }

    /// Read-only float view
    ///
    /// Ensures the float form is valid; an existing quantized payload stays
    /// valid alongside it.
    ///
    /// # Errors
    ///
    /// Currently infallible for well-formed tensors; see [`Self::float_mut`].
    pub fn float(&mut self) -> Result<&[f32]> {
        self.repr = match std::mem::replace(&mut self.repr, Repr::Empty) {
            Repr::Empty => Repr::FloatOnly(vec![0.0; self.len]),
            Repr::FloatOnly(f) => Repr::FloatOnly(f),
            Repr::QuantOnly(qt) => Repr::Both(dequantize(&qt), qt),
            Repr::Both(f, qt) => Repr::Both(f, qt),
        };
        match &self.repr {
            Repr::FloatOnly(f) | Repr::Both(f, _) => Ok(f.as_slice()),
            _ => unreachable!("float always leaves a float payload"),
        }
    }

    /// Refuse a quantized access whose group size conflicts with the stored payload
    fn check_group_size(&self, group_size: u32) -> Result<()> {
        match &self.repr {
            Repr::QuantOnly(qt) | Repr::Both(_, qt) if qt.group_size != group_size => {
                Err(InferenciaError::ReQuantizeRefused {
                    existing: qt.group_size,
                    requested: group_size,
                })
            }
            _ => Ok(()),
        }
    }

    /// Mutable quantized view at `group_size`
    ///
    /// Ensures the quantized form is valid (quantizing from float if
    /// needed), then drops the float payload.
    ///
    /// # Errors
    ///
    /// - `ReQuantizeRefused` if a quantized payload with a different group
    ///   size is already stored
    /// - `InvalidConfig` if `group_size` does not divide the length
    pub fn quant_mut(&mut self, group_size: u32) -> Result<&mut QuantizedTensor> {
        self.check_group_size(group_size)?;
        self.repr = match std::mem::replace(&mut self.repr, Repr::Empty) {
            Repr::Empty => Repr::QuantOnly(quantize(&vec![0.0; self.len], group_size)?),
            Repr::FloatOnly(f) => Repr::QuantOnly(quantize(&f, group_size)?),
            Repr::QuantOnly(qt) | Repr::Both(_, qt) => Repr::QuantOnly(qt),
        };
        match &mut self.repr {
            Repr::QuantOnly(qt) => Ok(qt),
            _ => unreachable!("quant_mut always leaves a quantized payload"),
        }
    }

    /// Read-only quantized view, requiring an already-valid payload
    ///
    /// # Errors
    ///
    /// Returns `QuantNotReady` when no quantized payload is valid.
    pub fn quant(&self) -> Result<&QuantizedTensor> {
        match &self.repr {
            Repr::QuantOnly(qt) | Repr::Both(_, qt) => Ok(qt),
            _ => Err(InferenciaError::QuantNotReady),
        }
    }

    /// Read-only quantized view at `group_size`, materializing if needed
    ///
    /// An existing float payload stays valid alongside the quantized one.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::quant_mut`].
    pub fn quant_with(&mut self, group_size: u32) -> Result<&QuantizedTensor> {
        self.check_group_size(group_size)?;
        self.repr = match std::mem::replace(&mut self.repr, Repr::Empty) {
            Repr::Empty => Repr::QuantOnly(quantize(&vec![0.0; self.len], group_size)?),
            Repr::FloatOnly(f) => {
                let qt = quantize(&f, group_size)?;
                Repr::Both(f, qt)
            }
            Repr::QuantOnly(qt) => Repr::QuantOnly(qt),
            Repr::Both(f, qt) => Repr::Both(f, qt),
        };
        match &self.repr {
            Repr::QuantOnly(qt) | Repr::Both(_, qt) => Ok(qt),
            _ => unreachable!("quant_with always leaves a quantized payload"),
        }
    }

    /// Read one tensor payload from a checkpoint stream
    ///
    /// The payload begins with a `u32` group-size marker: zero means `len`
    /// raw f32 values follow; anything else means `len` int8 values then
    /// `len / group_size` f32 scales. Exactly one representation is valid
    /// afterwards.
    ///
    /// # Errors
    ///
    /// - `Io` on short reads
    /// - `InvalidConfig` if the marker does not divide the length
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        let group_size = read_u32(reader)?;

        if group_size == 0 {
            let floats = read_f32_vec(reader, self.len)?;
            self.repr = Repr::FloatOnly(floats);
            return Ok(());
        }

        let gs = group_size as usize;
        if self.len % gs != 0 {
            return Err(InferenciaError::InvalidConfig {
                reason: format!(
                    "group size {group_size} does not divide tensor length {}",
                    self.len
                ),
            });
        }

        let q = read_i8_vec(reader, self.len)?;
        let s = read_f32_vec(reader, self.len / gs)?;
        self.repr = Repr::QuantOnly(QuantizedTensor { group_size, q, s });
        Ok(())
    }

    /// Adopt a float payload, invalidating any quantized form
    pub fn assign_float(&mut self, data: Vec<f32>) {
        self.len = data.len();
        self.repr = Repr::FloatOnly(data);
    }

    /// Adopt a quantized payload, invalidating any float form
    pub fn assign_quant(&mut self, qt: QuantizedTensor) {
        self.len = qt.q.len();
        self.repr = Repr::QuantOnly(qt);
    }

    /// Adopt another tensor's payloads and validity state
    pub fn assign(&mut self, other: &Tensor) {
        self.len = other.len;
        self.repr = other.repr.clone();
    }
}

/// Read a little-endian `u32`
pub(crate) fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian `i32`
pub(crate) fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read a little-endian `f32`
pub(crate) fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

/// Read `count` little-endian `f32` values in one pass
pub(crate) fn read_f32_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; count * 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Read `count` raw `i8` values in one pass
pub(crate) fn read_i8_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<i8>> {
    let mut bytes = vec![0u8; count];
    reader.read_exact(&mut bytes)?;
    Ok(bytes.into_iter().map(|b| b as i8).collect())
}
