use std::sync::Arc;

use crate::compress::{Compressor, CompressorId, COMPRESSOR_NONE};
use crate::error::StreamError;
use crate::swap::Scalar;

/// Flush threshold: a bucket is emitted once the staging buffer grows past
/// this many bytes, always on a write-operation boundary.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// One outgoing bucket, borrowed for the duration of the send.
pub struct BucketOut<'a> {
    pub compressor: CompressorId,
    pub n_chunks: u32,
    pub uncompressed_size: u64,
    pub payload: &'a [u8],
    pub last: bool,
}

/// Receives the buckets an [`OutputStream`] produces; implementors frame
/// them into wire packets.
pub trait BucketSink {
    fn send_bucket(&mut self, bucket: BucketOut<'_>) -> Result<(), StreamError>;
}

/// A value serializable onto an output stream, element by element.
pub trait Encode {
    fn encode<K: BucketSink>(&self, stream: &mut OutputStream<K>) -> Result<(), StreamError>;
}

/// Stages logical writes and emits them as buckets.
///
/// A bucket boundary only ever falls between two complete write
/// operations; this is what lets the receiving side hand out
/// zero-copy views without bucket-spanning logic.
pub struct OutputStream<K> {
    sink: K,
    buffer: Vec<u8>,
    chunk_size: usize,
    compressor: Option<Arc<dyn Compressor>>,
    finished: bool,
}

impl<K: BucketSink> OutputStream<K> {
    pub fn new(sink: K) -> Self {
        Self {
            sink,
            buffer: Vec::with_capacity(DEFAULT_CHUNK_SIZE),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compressor: None,
            finished: false,
        }
    }

    /// Compress every bucket with `compressor` instead of sending
    /// size-prefixed raw chunks.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(16);
        self
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    /// Write one scalar in native byte order.
    pub fn write<T: Scalar>(&mut self, value: T) -> Result<(), StreamError> {
        value.write_ne(&mut self.buffer);
        self.maybe_flush()
    }

    /// Write a length-prefixed sequence of trivial scalars as one
    /// operation.
    pub fn write_vec<T: Scalar>(&mut self, values: &[T]) -> Result<(), StreamError> {
        (values.len() as u64).write_ne(&mut self.buffer);
        for value in values {
            value.write_ne(&mut self.buffer);
        }
        self.maybe_flush()
    }

    /// Write length-prefixed text: u64 byte count then raw bytes, no
    /// terminator, as one operation.
    pub fn write_string(&mut self, text: &str) -> Result<(), StreamError> {
        (text.len() as u64).write_ne(&mut self.buffer);
        self.buffer.extend_from_slice(text.as_bytes());
        self.maybe_flush()
    }

    /// Write a length-prefixed sequence of encodable elements.
    pub fn write_items<T: Encode>(&mut self, items: &[T]) -> Result<(), StreamError> {
        self.write(items.len() as u64)?;
        for item in items {
            item.encode(self)?;
        }
        Ok(())
    }

    /// Emit the staged bytes as one bucket. `last` marks the final bucket
    /// of the logical sequence.
    pub fn flush(&mut self, last: bool) -> Result<(), StreamError> {
        let uncompressed_size = self.buffer.len() as u64;
        match &self.compressor {
            Some(codec) if !self.buffer.is_empty() => {
                let packed = codec.compress(&self.buffer)?;
                self.sink.send_bucket(BucketOut {
                    compressor: codec.id(),
                    n_chunks: 1,
                    uncompressed_size,
                    payload: &packed,
                    last,
                })?;
            }
            _ => {
                let mut payload = Vec::with_capacity(8 + self.buffer.len());
                payload.extend_from_slice(&uncompressed_size.to_le_bytes());
                payload.extend_from_slice(&self.buffer);
                self.sink.send_bucket(BucketOut {
                    compressor: COMPRESSOR_NONE,
                    n_chunks: 1,
                    uncompressed_size,
                    payload: &payload,
                    last,
                })?;
            }
        }
        self.buffer.clear();
        if last {
            self.finished = true;
        }
        Ok(())
    }

    /// Flush the remainder and mark the sequence complete.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        if self.finished {
            return Ok(());
        }
        self.flush(true)
    }

    fn maybe_flush(&mut self) -> Result<(), StreamError> {
        debug_assert!(!self.finished, "write after finish");
        if self.buffer.len() >= self.chunk_size {
            self.flush(false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;
    use crate::compress::{CompressorRegistry, ZstdCompressor};
    use crate::istream::{BucketPayload, BucketSource, InputStream, RawBucket};
    use crate::region::Region;

    #[derive(Default)]
    struct Captured {
        compressor: CompressorId,
        uncompressed_size: u64,
        payload: Vec<u8>,
        last: bool,
    }

    /// Buffers buckets in memory and replays them as a source.
    #[derive(Default)]
    struct Loopback {
        buckets: VecDeque<Captured>,
    }

    impl BucketSink for Loopback {
        fn send_bucket(&mut self, bucket: BucketOut<'_>) -> Result<(), StreamError> {
            self.buckets.push_back(Captured {
                compressor: bucket.compressor,
                uncompressed_size: bucket.uncompressed_size,
                payload: bucket.payload.to_vec(),
                last: bucket.last,
            });
            Ok(())
        }
    }

    impl BucketSource for Loopback {
        fn next_bucket(&mut self) -> Result<Option<RawBucket>, StreamError> {
            let Some(captured) = self.buckets.pop_front() else {
                return Ok(None);
            };
            let region = Region::new(Arc::new(captured.payload));
            let payload = if captured.compressor == COMPRESSOR_NONE {
                BucketPayload::SizePrefixed(region)
            } else {
                BucketPayload::Compressed {
                    id: captured.compressor,
                    n_chunks: 1,
                    data: region,
                }
            };
            Ok(Some(RawBucket {
                payload,
                uncompressed_size: captured.uncompressed_size,
            }))
        }

        fn remaining_buckets(&self) -> usize {
            self.buckets.len()
        }
    }

    #[test]
    fn scalar_round_trip() {
        let mut out = OutputStream::new(Loopback::default());
        out.write(42i32).unwrap();
        out.write(43.0f32).unwrap();
        out.write(44.0f64).unwrap();
        out.write_string("fish").unwrap();
        out.finish().unwrap();

        let sink = std::mem::take(out.sink_mut());
        let mut input = InputStream::new(sink);
        assert_eq!(input.read::<i32>().unwrap(), 42);
        assert_eq!(input.read::<f32>().unwrap(), 43.0);
        assert_eq!(input.read::<f64>().unwrap(), 44.0);
        assert_eq!(input.read_string().unwrap(), "fish");
        assert!(!input.has_data());
    }

    #[test]
    fn flushes_only_between_operations() {
        let mut out = OutputStream::new(Loopback::default()).with_chunk_size(64);
        // 100 bytes in one operation: must land in a single bucket
        let block: Vec<u64> = (0..12).collect();
        out.write_vec(&block).unwrap();
        out.write(7u8).unwrap();
        out.finish().unwrap();

        let sink = std::mem::take(out.sink_mut());
        // first bucket holds the whole vector despite exceeding chunk_size
        assert_eq!(sink.buckets[0].uncompressed_size, 8 + 12 * 8);

        let mut input = InputStream::new(sink);
        assert_eq!(input.read_vec::<u64>().unwrap(), block);
        assert_eq!(input.read::<u8>().unwrap(), 7);
    }

    #[test]
    fn compressed_round_trip() {
        let registry = Arc::new(CompressorRegistry::with_defaults());
        let codec: Arc<dyn Compressor> = Arc::new(ZstdCompressor::default());
        let mut out = OutputStream::new(Loopback::default()).with_compressor(codec);

        let data: Vec<u8> = (0..32_768u32).map(|i| (i % 13) as u8).collect();
        out.write_vec(&data).unwrap();
        out.finish().unwrap();

        let sink = std::mem::take(out.sink_mut());
        let wire: usize = sink.buckets.iter().map(|b| b.payload.len()).sum();
        assert!(wire < data.len());

        let mut input = InputStream::new(sink).with_registry(registry);
        assert_eq!(input.read_vec::<u8>().unwrap(), data);
    }

    #[test]
    fn last_flag_marks_final_bucket() {
        let mut out = OutputStream::new(Loopback::default()).with_chunk_size(16);
        for i in 0..8u64 {
            out.write(i).unwrap();
        }
        out.finish().unwrap();
        let sink = std::mem::take(out.sink_mut());
        let n = sink.buckets.len();
        assert!(n > 1);
        for (i, bucket) in sink.buckets.iter().enumerate() {
            assert_eq!(bucket.last, i == n - 1);
        }
    }
}
