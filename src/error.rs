//! Error types for Inferencia
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Inferencia operations
pub type Result<T> = std::result::Result<T, InferenciaError>;

/// Error type for all Inferencia operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenciaError {
    /// I/O failure while reading a checkpoint or tokenizer artifact
    #[error("I/O error: {reason}")]
    Io {
        /// Rendered cause (file missing, truncated read)
        reason: String,
    },

    /// Checkpoint magic number is not `0x616b3432` ("ak42")
    #[error("Bad magic number: expected 0x616b3432, got {found:#010x}")]
    BadMagic {
        /// Magic value actually present in the file
        found: u32,
    },

    /// Checkpoint version is unsupported
    #[error("Bad checkpoint version: expected 1, got {found}")]
    BadVersion {
        /// Version actually present in the file
        found: i32,
    },

    /// Vector size mismatch in a linear forward
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Const quantized access on a tensor with no valid quantized payload
    #[error("Quantized payload not ready: tensor holds no valid quantized form")]
    QuantNotReady,

    /// Mutable quantized access with a group size that differs from the stored one
    #[error("Refusing to re-quantize: tensor already quantized with group size {existing}, requested {requested}")]
    ReQuantizeRefused {
        /// Group size of the payload already stored
        existing: u32,
        /// Group size requested by the caller
        requested: u32,
    },

    /// Checkpoint header violates a model invariant
    #[error("Invalid config: {reason}")]
    InvalidConfig {
        /// Which invariant failed
        reason: String,
    },

    /// Tokenizer produced zero tokens for the prompt
    #[error("Empty prompt: expected at least 1 prompt token")]
    EmptyPrompt,

    /// Unrecognized run mode on the command line
    #[error("Unknown mode: {mode} (expected generate|chat)")]
    UnknownMode {
        /// Mode string supplied by the user
        mode: String,
    },
}

impl From<std::io::Error> for InferenciaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}
