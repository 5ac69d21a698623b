//! # Fresco Stream
//! Bucketized binary data streams shared by the fresco runtime crates.
//!
//! A sender chops a logical byte sequence into *buckets* (optionally
//! compressed) which travel as discrete wire payloads; the receiving
//! [`InputStream`] splices them back into a single typed cursor. Writes
//! never straddle a bucket boundary, so a symmetric read of the same size
//! always finds its bytes in one bucket.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod compress;
mod error;
mod istream;
mod ostream;
mod region;
mod swap;

pub use compress::{
    Compressor, CompressorId, CompressorRegistry, ZstdCompressor, COMPRESSOR_NONE, COMPRESSOR_ZSTD,
};
pub use error::StreamError;
pub use istream::{BucketPayload, BucketSource, Decode, InputStream, RawBucket, MAX_SEQUENCE_LEN};
pub use ostream::{BucketOut, BucketSink, Encode, OutputStream, DEFAULT_CHUNK_SIZE};
pub use region::{ByteStore, Region};
pub use swap::Scalar;
