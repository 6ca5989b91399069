//! zstd compression for serialized Instructions.
//!
//! Both paths compress before encrypting: terminal traffic is repetitive
//! enough that even small frames shrink, and always compressing keeps the
//! wire format unconditional (no "was it compressed" flag to carry).

use std::io::Read;

use thiserror::Error;

/// zstd compression level; terminal frames are small, favor speed.
const COMPRESSION_LEVEL: i32 = 3;

/// Ceiling on decompressed size, against decompression bombs.
const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Errors from compression operations.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// zstd compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// zstd decompression failed (malformed or corrupted input).
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Decompressed size exceeds the safety limit.
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Actual decompressed size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// Compress a serialized Instruction.
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::stream::encode_all(data, COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressionFailed(e.to_string()))
}

/// Decompress a received Instruction body, bounded by the size limit.
pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let decoder = zstd::stream::Decoder::new(data)
        .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

    let mut output = Vec::new();
    decoder
        .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

    if output.len() > MAX_DECOMPRESSED_SIZE {
        return Err(CompressionError::SizeExceeded {
            size: output.len(),
            limit: MAX_DECOMPRESSED_SIZE,
        });
    }

    Ok(output)
}
