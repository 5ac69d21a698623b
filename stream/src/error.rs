use thiserror::Error;

use crate::compress::CompressorId;

/// Errors produced while assembling or draining a bucketized stream.
///
/// Every variant reachable from network input is a recoverable protocol
/// error; the stream resets itself and the caller decides whether to drop
/// the producing connection.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("input stream exhausted while reading {wanted} more bytes")]
    Exhausted { wanted: usize },

    #[error("out-of-sync stream: length prefix of {elements} elements")]
    LengthOutOfBounds { elements: u64 },

    #[error("text of {bytes} bytes exceeds the current bucket ({remaining} left)")]
    TextOutOfBounds { bytes: u64, remaining: u64 },

    #[error("text payload is not valid UTF-8")]
    InvalidText,

    #[error("unknown compressor {0:#010x}")]
    UnknownCompressor(CompressorId),

    #[error("decompression of {size} compressed bytes failed")]
    Decompress {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("compression failed")]
    Compress(#[source] std::io::Error),

    #[error("bucket size mismatch: redundancy header says {header}, bucket says {expected}")]
    SizeMismatch { header: u64, expected: u64 },

    #[error("bucket sink rejected data: {0}")]
    Sink(String),
}
