//! The compressor plugin registry.
//!
//! Buckets carry a compressor id; `COMPRESSOR_NONE` means the payload is a
//! size-prefixed raw chunk. Anything else is resolved through the registry
//! the stream was built with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StreamError;

pub type CompressorId = u32;

/// Reserved id for uncompressed buckets.
pub const COMPRESSOR_NONE: CompressorId = 0;

/// The default zstd compressor.
pub const COMPRESSOR_ZSTD: CompressorId = 1;

/// A pluggable bucket compressor.
pub trait Compressor: Send + Sync {
    fn id(&self) -> CompressorId;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, StreamError>;

    /// Decompress `data`, whose original size the bucket header advertised.
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, StreamError>;
}

/// zstd bulk compression, the stack's default codec.
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn id(&self) -> CompressorId {
        COMPRESSOR_ZSTD
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, StreamError> {
        zstd::bulk::compress(data, self.level).map_err(StreamError::Compress)
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, StreamError> {
        let out = zstd::bulk::decompress(data, uncompressed_size).map_err(|source| {
            StreamError::Decompress {
                size: data.len(),
                source,
            }
        })?;
        if out.len() != uncompressed_size {
            return Err(StreamError::SizeMismatch {
                header: out.len() as u64,
                expected: uncompressed_size as u64,
            });
        }
        Ok(out)
    }
}

/// Registry of compressor plugins, keyed by wire id.
pub struct CompressorRegistry {
    plugins: RwLock<HashMap<CompressorId, Arc<dyn Compressor>>>,
}

impl CompressorRegistry {
    pub fn empty() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the default zstd codec installed.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(ZstdCompressor::default()));
        registry
    }

    pub fn register(&self, compressor: Arc<dyn Compressor>) {
        self.plugins.write().insert(compressor.id(), compressor);
    }

    pub fn get(&self, id: CompressorId) -> Option<Arc<dyn Compressor>> {
        self.plugins.read().get(&id).cloned()
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_round_trip() {
        let codec = ZstdCompressor::default();
        let data: Vec<u8> = (0..4096u32).map(|i| (i / 16) as u8).collect();
        let packed = codec.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = codec.decompress(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn registry_lookup() {
        let registry = CompressorRegistry::with_defaults();
        assert!(registry.get(COMPRESSOR_ZSTD).is_some());
        assert!(registry.get(0xdead).is_none());
    }

    #[test]
    fn garbage_input_is_an_error() {
        let codec = ZstdCompressor::default();
        assert!(codec.decompress(&[0, 1, 2, 3, 4, 5], 64).is_err());
    }
}
