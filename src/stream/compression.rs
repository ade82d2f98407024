// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-chunk compression and payload digests.
//!
//! Chunks are compressed independently with zstd, and only when that
//! actually shrinks them. Decompression is bounded by the uncompressed
//! length declared in the packet header so a corrupted header cannot make
//! the receiver allocate unbounded memory.

use crate::config::StreamConfig;
use crate::error::{ReplicationError, Result};
use crate::packet::Compressor;
use sha2::{Digest, Sha256};

/// zstd magic bytes for frame detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Largest uncompressed chunk a receiver will accept.
pub const MAX_CHUNK_PAYLOAD: usize = 64 * 1024 * 1024;

/// Compress a chunk if configured and beneficial.
///
/// Returns `None` when the chunk should travel uncompressed.
pub fn compress_chunk(data: &[u8], config: &StreamConfig) -> Option<Vec<u8>> {
    if !config.compression_enabled || data.len() < config.min_compress_size {
        return None;
    }
    match zstd::bulk::compress(data, config.compression_level) {
        Ok(compressed) if compressed.len() < data.len() => Some(compressed),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, len = data.len(), "zstd compression failed, sending raw");
            None
        }
    }
}

/// Restore a chunk payload to its uncompressed form.
pub fn decompress_chunk(compressor: Compressor, data: &[u8], expected_len: u64) -> Result<Vec<u8>> {
    let expected = usize::try_from(expected_len)
        .ok()
        .filter(|len| *len <= MAX_CHUNK_PAYLOAD)
        .ok_or_else(|| {
            ReplicationError::Decompression(format!("declared chunk length {} too large", expected_len))
        })?;

    match compressor {
        Compressor::None => {
            if data.len() != expected {
                return Err(ReplicationError::StreamParse(format!(
                    "chunk length mismatch: header says {}, payload has {}",
                    expected,
                    data.len()
                )));
            }
            Ok(data.to_vec())
        }
        Compressor::Zstd => {
            if data.len() < 4 || data[..4] != ZSTD_MAGIC {
                return Err(ReplicationError::Decompression("missing zstd magic".to_string()));
            }
            let decompressed = zstd::bulk::decompress(data, expected)
                .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
            if decompressed.len() != expected {
                return Err(ReplicationError::Decompression(format!(
                    "zstd produced {} bytes, expected {}",
                    decompressed.len(),
                    expected
                )));
            }
            Ok(decompressed)
        }
    }
}

/// SHA-256 of a payload as lowercase hex.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
