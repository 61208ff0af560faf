//! Checkpoint loading
//!
//! An ak42 checkpoint is a little-endian binary file:
//! - offset 0: `u32` magic `0x616b3432` ("ak42")
//! - offset 4: `i32` version, must be 1
//! - offset 8: packed config (seven `i32` fields, a `u8` shared-classifier
//!   flag, three padding bytes)
//! - offset 256: weight tensors in model order, each led by its `u32`
//!   group-size marker
//!
//! The file is consumed through a buffered stream and released as soon as
//! the weights are ingested; nothing is memory-mapped.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::error::{InferenciaError, Result};
use crate::model::{Config, Transformer};
use crate::tensor::{read_i32, read_u32};

/// "ak42" in little-endian ASCII
pub const CHECKPOINT_MAGIC: u32 = 0x616b_3432;

/// The only supported checkpoint version
pub const CHECKPOINT_VERSION: i32 = 1;

/// Byte offset where the weight stream begins
const WEIGHTS_OFFSET: u64 = 256;

/// Validate the magic and version, then read the packed config
///
/// # Errors
///
/// - `BadMagic` / `BadVersion` on header mismatch
/// - `Io` on short reads
/// - `InvalidConfig` when the header violates a model invariant
pub fn read_header<R: Read>(reader: &mut R) -> Result<Config> {
    let magic = read_u32(reader)?;
    if magic != CHECKPOINT_MAGIC {
        return Err(InferenciaError::BadMagic { found: magic });
    }

    let version = read_i32(reader)?;
    if version != CHECKPOINT_VERSION {
        return Err(InferenciaError::BadVersion { found: version });
    }

    let config = Config::read_from(reader)?;
    config.validate()?;
    Ok(config)
}

/// Build a transformer from any seekable checkpoint stream
///
/// # Errors
///
/// Propagates header and weight-stream failures.
pub fn load_transformer_from<R: Read + Seek>(reader: &mut R) -> Result<Transformer> {
    let config = read_header(reader)?;
    reader.seek(SeekFrom::Start(WEIGHTS_OFFSET))?;

    let mut transformer = Transformer::new(config)?;
    transformer.load_weights(reader)?;
    Ok(transformer)
}

/// Build a transformer from a checkpoint file on disk
///
/// # Errors
///
/// Returns `Io` when the file cannot be opened, plus all stream failures.
pub fn load_transformer(path: &Path) -> Result<Transformer> {
    debug!(path = %path.display(), "loading checkpoint");
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    load_transformer_from(&mut reader)
}
