//! LZ4 compression for stored content blobs
//!
//! The content store passes every blob through a [`CompressionEngine`] before
//! it reaches disk. Blobs are framed with a 4-byte header:
//!
//! - `LZ4C`: LZ4 block with prepended size follows
//! - `\0\0\0\0`: raw bytes follow
//!
//! Compression is only kept when it actually shrinks the blob.
//!
//! ## Examples
//!
//! ```rust
//! use chronik::compression::{CompressionEngine, CompressionStrategy};
//!
//! let mut engine = CompressionEngine::new(CompressionStrategy::Fast);
//! let data = "fn main() {}\n".repeat(200).into_bytes();
//! let compressed = engine.compress(&data).unwrap();
//! assert!(compressed.len() < data.len());
//! assert_eq!(engine.decompress(&compressed).unwrap(), data);
//! ```

use crate::error::{ChronikError, Result};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::trace;

/// When to compress stored blobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionStrategy {
    /// Store every blob raw
    None,
    /// LZ4 for blobs of at least 1 KiB (default)
    #[default]
    Fast,
    /// LZ4 for blobs of at least `min_size` bytes
    Adaptive {
        /// Skip compression below this size
        min_size: usize,
    },
}

/// Compression statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Number of blobs compressed
    pub blobs_compressed: usize,
    /// Number of blobs stored raw
    pub blobs_stored_raw: usize,
    /// Total bytes saved by compression
    pub bytes_saved: usize,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
}

impl CompressionStats {
    /// Fraction of blobs that were stored compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.blobs_compressed + self.blobs_stored_raw;
        if total == 0 {
            return 0.0;
        }
        self.blobs_compressed as f64 / total as f64
    }
}

/// Compression engine used by the file content store
///
/// Not thread-safe on its own; the content store keeps it behind a mutex.
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: CompressionStats,
}

const LZ4_MAGIC: &[u8; 4] = b"LZ4C";
const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

impl CompressionEngine {
    /// Create a new compression engine with the specified strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            stats: CompressionStats::default(),
        }
    }

    /// Strategy this engine was created with
    pub fn strategy(&self) -> CompressionStrategy {
        self.strategy
    }

    /// Get current compression statistics
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Frame a blob, compressing it when the strategy allows and it helps
    pub fn compress(&mut self, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        if self.should_compress(content.len()) {
            let compressed = compress_prepend_size(content);
            if compressed.len() < content.len() {
                self.stats.bytes_saved += content.len() - compressed.len();
                self.stats.blobs_compressed += 1;
                self.stats.compression_time_ms += start.elapsed().as_millis() as u64;
                trace!("Compressed blob: {} -> {} bytes", content.len(), compressed.len());

                let mut result = Vec::with_capacity(LZ4_MAGIC.len() + compressed.len());
                result.extend_from_slice(LZ4_MAGIC);
                result.extend_from_slice(&compressed);
                return Ok(result);
            }
        }

        self.stats.blobs_stored_raw += 1;
        let mut result = Vec::with_capacity(RAW_MAGIC.len() + content.len());
        result.extend_from_slice(RAW_MAGIC);
        result.extend_from_slice(content);
        Ok(result)
    }

    /// Undo [`compress`](Self::compress)
    ///
    /// Unknown headers are rejected: blobs are only ever written by this
    /// engine, so anything else is a damaged object.
    pub fn decompress(&mut self, content: &[u8]) -> Result<Vec<u8>> {
        if content.len() < 4 {
            return Err(ChronikError::decompression("Content too short"));
        }

        let (magic, body) = content.split_at(4);
        if magic == LZ4_MAGIC {
            let declared = body
                .get(..4)
                .and_then(|prefix| <[u8; 4]>::try_from(prefix).ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| ChronikError::decompression("Missing LZ4 size prefix"))?;
            // LZ4 cannot expand a block by more than 255x
            if declared as usize > body.len().saturating_mul(255) {
                return Err(ChronikError::decompression(format!(
                    "LZ4 size prefix {} does not fit a {} byte blob",
                    declared,
                    body.len()
                )));
            }
            decompress_size_prepended(body).map_err(|e| {
                ChronikError::decompression(format!("LZ4 decompression failed: {}", e))
            })
        } else if magic == RAW_MAGIC {
            Ok(body.to_vec())
        } else {
            Err(ChronikError::decompression(format!(
                "Unknown blob header {:02x?}",
                magic
            )))
        }
    }

    fn should_compress(&self, size: usize) -> bool {
        match self.strategy {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => size >= 1024,
            CompressionStrategy::Adaptive { min_size } => size >= min_size.max(64),
        }
    }
}
