//! Content addressing and compression.
//!
//! Object ids are the SHA-256 of the original payload, so two callers storing
//! the same bytes under different keys converge on one record. Chunk checksums
//! use the same digest over the encrypted chunk bytes.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from the compression stage.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compress(String),

    #[error("Decompression failed: {0}")]
    Decompress(String),
}

/// Compute SHA-256 and return lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Content-derived object id for an original payload.
pub fn content_id(payload: &[u8]) -> String {
    sha256_hex(payload)
}

/// Checksum recorded for a stored chunk.
pub fn chunk_checksum(chunk: &[u8]) -> String {
    sha256_hex(chunk)
}

/// Whether `chunk` still matches the checksum recorded at write time.
pub fn verify_checksum(chunk: &[u8], expected: &str) -> bool {
    chunk_checksum(chunk) == expected
}

/// Short prefix form useful for logging.
pub fn short_id(id: &str) -> &str {
    id.get(0..12).unwrap_or(id)
}

/// Compress a payload with zstd at the given level.
pub fn compress(payload: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    zstd::stream::encode_all(payload, level).map_err(|e| CodecError::Compress(e.to_string()))
}

/// Reverse [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::decode_all(data).map_err(|e| CodecError::Decompress(e.to_string()))
}

/// Compressed size over original size; 1.0 for empty payloads.
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if original == 0 {
        1.0
    } else {
        compressed as f64 / original as f64
    }
}
