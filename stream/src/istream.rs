use std::sync::Arc;

use log::warn;

use crate::compress::{CompressorRegistry, CompressorId};
use crate::error::StreamError;
use crate::region::Region;
use crate::swap::Scalar;

/// Sequence length prefixes beyond this are treated as stream corruption.
pub const MAX_SEQUENCE_LEN: u64 = 1 << 48;

/// Payload of one bucket as delivered by a [`BucketSource`].
pub enum BucketPayload {
    /// Plain bytes, no framing. Used by command payload cursors.
    Raw(Region),
    /// `[u64 size][bytes]` as produced by an uncompressed output stream;
    /// the leading size is a redundancy check against the bucket header.
    SizePrefixed(Region),
    /// Compressed chunk data to be expanded through the registry.
    Compressed {
        id: CompressorId,
        n_chunks: u32,
        data: Region,
    },
}

/// One bucket plus the decompressed byte count its header advertised.
pub struct RawBucket {
    pub payload: BucketPayload,
    pub uncompressed_size: u64,
}

/// Supplies buckets to an [`InputStream`]; the command FIFO behind an
/// object data stream is the main implementor.
pub trait BucketSource {
    /// The next bucket, `None` once the producer is exhausted.
    fn next_bucket(&mut self) -> Result<Option<RawBucket>, StreamError>;

    /// Number of buckets not yet handed out.
    fn remaining_buckets(&self) -> usize;
}

/// A value deserializable from an input stream, element by element.
pub trait Decode: Sized {
    fn decode<S: BucketSource>(stream: &mut InputStream<S>) -> Result<Self, StreamError>;
}

/// Splices the buckets of a [`BucketSource`] into one logical byte
/// sequence and reads typed values off it.
///
/// The matching output stream only flushes between complete write
/// operations, so a symmetric read never has to straddle a bucket
/// boundary; [`InputStream::read_bytes`] still walks buckets for safety.
pub struct InputStream<S> {
    source: S,
    registry: Option<Arc<CompressorRegistry>>,
    bucket: Option<Region>,
    pos: usize,
    swap: bool,
}

impl<S: BucketSource> InputStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            registry: None,
            bucket: None,
            pos: 0,
            swap: false,
        }
    }

    /// Attach the compressor registry used to expand compressed buckets.
    pub fn with_registry(mut self, registry: Arc<CompressorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enable or disable byte swapping of scalar reads.
    pub fn set_swapping(&mut self, on: bool) {
        self.swap = on;
    }

    pub fn is_swapping(&self) -> bool {
        self.swap
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Drop the current bucket and cursor position. The source keeps its
    /// own notion of what remains.
    pub fn reset(&mut self) {
        self.bucket = None;
        self.pos = 0;
    }

    /// True while unread data remains; loads the next bucket if needed.
    pub fn has_data(&mut self) -> bool {
        matches!(self.ensure_bucket(), Ok(true))
    }

    /// Copy exactly `dst.len()` bytes out of the stream.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < dst.len() {
            if !self.ensure_bucket()? {
                let wanted = dst.len() - filled;
                self.reset();
                return Err(StreamError::Exhausted { wanted });
            }
            let Some(bucket) = &self.bucket else {
                return Err(StreamError::Exhausted {
                    wanted: dst.len() - filled,
                });
            };
            let avail = bucket.len() - self.pos;
            let take = avail.min(dst.len() - filled);
            dst[filled..filled + take]
                .copy_from_slice(&bucket.as_bytes()[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }

    /// Read one scalar, swapping if the producer's byte order differs.
    pub fn read<T: Scalar>(&mut self) -> Result<T, StreamError> {
        let mut raw = [0u8; 16];
        self.read_bytes(&mut raw[..T::WIDTH])?;
        let value = T::read_ne(&raw[..T::WIDTH]);
        Ok(if self.swap { value.byte_swapped() } else { value })
    }

    /// Read a length-prefixed sequence of trivial scalars in one bulk copy,
    /// swapping each element as needed.
    pub fn read_vec<T: Scalar>(&mut self) -> Result<Vec<T>, StreamError> {
        let n = self.read::<u64>()?;
        self.check_sequence_len(n)?;
        let count = n as usize;
        let mut raw = vec![0u8; count * T::WIDTH];
        self.read_bytes(&mut raw)?;
        let mut out = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(T::WIDTH) {
            let value = T::read_ne(chunk);
            out.push(if self.swap { value.byte_swapped() } else { value });
        }
        Ok(out)
    }

    /// Read a length-prefixed sequence of decodable elements.
    pub fn read_items<T: Decode>(&mut self) -> Result<Vec<T>, StreamError> {
        let n = self.read::<u64>()?;
        self.check_sequence_len(n)?;
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            out.push(T::decode(self)?);
        }
        Ok(out)
    }

    /// Read length-prefixed text: a u64 byte count then raw bytes, no
    /// terminator. The sender wrote prefix and bytes as one operation, so
    /// both live in the current bucket.
    pub fn read_string(&mut self) -> Result<String, StreamError> {
        let n = self.read::<u64>()?;
        if n == 0 {
            return Ok(String::new());
        }
        let remaining = self.remaining_buffer_size();
        if n > remaining {
            warn!("out-of-sync stream: {n} text bytes with {remaining} in bucket");
            debug_assert!(false, "text length prefix exceeds bucket");
            self.reset();
            return Err(StreamError::TextOutOfBounds {
                bytes: n,
                remaining,
            });
        }
        let region = self
            .get_remaining_buffer(n)
            .ok_or(StreamError::Exhausted { wanted: n as usize })?;
        String::from_utf8(region.as_bytes().to_vec()).map_err(|_| StreamError::InvalidText)
    }

    /// Zero-copy view of the next `size` bytes of the current bucket,
    /// advancing the cursor. `None` if the bucket holds fewer bytes; no
    /// bucket-spanning view is ever produced.
    pub fn get_remaining_buffer(&mut self, size: u64) -> Option<Region> {
        if !self.has_data() {
            return None;
        }
        let bucket = self.bucket.as_ref()?;
        let avail = bucket.len() - self.pos;
        if (avail as u64) < size {
            return None;
        }
        let region = bucket.slice(self.pos..self.pos + size as usize);
        self.pos += size as usize;
        Some(region)
    }

    /// Bytes left in the current bucket.
    pub fn remaining_buffer_size(&mut self) -> u64 {
        if !self.has_data() {
            return 0;
        }
        match &self.bucket {
            Some(bucket) => (bucket.len() - self.pos) as u64,
            None => 0,
        }
    }

    fn check_sequence_len(&mut self, n: u64) -> Result<(), StreamError> {
        if n >= MAX_SEQUENCE_LEN {
            warn!("out-of-sync stream: {n} elements?");
            debug_assert!(false, "length prefix out of bounds");
            self.reset();
            return Err(StreamError::LengthOutOfBounds { elements: n });
        }
        Ok(())
    }

    /// Make sure a non-empty bucket is loaded; false once the source is
    /// exhausted.
    fn ensure_bucket(&mut self) -> Result<bool, StreamError> {
        loop {
            if let Some(bucket) = &self.bucket {
                if self.pos < bucket.len() {
                    return Ok(true);
                }
            }
            match self.source.next_bucket()? {
                None => {
                    self.bucket = None;
                    return Ok(false);
                }
                Some(raw) => self.adopt(raw)?,
            }
        }
    }

    fn adopt(&mut self, raw: RawBucket) -> Result<(), StreamError> {
        let region = match raw.payload {
            BucketPayload::Raw(region) => region,
            BucketPayload::SizePrefixed(region) => {
                if region.len() < 8 {
                    return Err(StreamError::Exhausted {
                        wanted: 8 - region.len(),
                    });
                }
                let mut header = [0u8; 8];
                header.copy_from_slice(&region.as_bytes()[..8]);
                let header = u64::from_le_bytes(header);
                if header != raw.uncompressed_size {
                    debug_assert!(false, "bucket redundancy check failed");
                    return Err(StreamError::SizeMismatch {
                        header,
                        expected: raw.uncompressed_size,
                    });
                }
                let len = region.len();
                region.slice(8..len)
            }
            BucketPayload::Compressed { id, n_chunks: _, data } => {
                let registry = self
                    .registry
                    .as_ref()
                    .ok_or(StreamError::UnknownCompressor(id))?;
                let codec = registry.get(id).ok_or(StreamError::UnknownCompressor(id))?;
                let out = codec.decompress(data.as_bytes(), raw.uncompressed_size as usize)?;
                Region::new(Arc::new(out))
            }
        };
        self.bucket = Some(region);
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;

    /// Replays pre-built buckets, the way a command FIFO would.
    struct Replay {
        buckets: VecDeque<RawBucket>,
    }

    impl Replay {
        fn raw(chunks: Vec<Vec<u8>>) -> Self {
            let buckets = chunks
                .into_iter()
                .map(|c| RawBucket {
                    uncompressed_size: c.len() as u64,
                    payload: BucketPayload::Raw(Region::new(Arc::new(c))),
                })
                .collect();
            Self { buckets }
        }
    }

    impl BucketSource for Replay {
        fn next_bucket(&mut self) -> Result<Option<RawBucket>, StreamError> {
            Ok(self.buckets.pop_front())
        }

        fn remaining_buckets(&self) -> usize {
            self.buckets.len()
        }
    }

    fn encode<T: Scalar>(value: T) -> Vec<u8> {
        let mut out = Vec::new();
        value.write_ne(&mut out);
        out
    }

    #[test]
    fn reads_across_buckets() {
        let mut first = encode(7u32);
        first.extend(encode(8u32));
        let second = encode(9u32);
        let mut stream = InputStream::new(Replay::raw(vec![first, second]));

        assert_eq!(stream.read::<u32>().unwrap(), 7);
        assert_eq!(stream.read::<u32>().unwrap(), 8);
        assert_eq!(stream.read::<u32>().unwrap(), 9);
        assert!(!stream.has_data());
        assert!(matches!(
            stream.read::<u32>(),
            Err(StreamError::Exhausted { .. })
        ));
    }

    #[test]
    fn swapped_scalars() {
        // A producer with the opposite byte order writes the swapped
        // representation; reading with swap enabled restores the value.
        let mut data = encode(0x1234_5678u32.byte_swapped());
        data.extend(encode(2.5f64.byte_swapped()));
        let mut stream = InputStream::new(Replay::raw(vec![data]));
        stream.set_swapping(true);

        assert_eq!(stream.read::<u32>().unwrap(), 0x1234_5678);
        assert_eq!(stream.read::<f64>().unwrap(), 2.5);
    }

    #[test]
    fn remaining_buffer_never_spans_buckets() {
        let mut stream = InputStream::new(Replay::raw(vec![vec![1, 2, 3, 4], vec![5, 6]]));

        assert_eq!(stream.remaining_buffer_size(), 4);
        let head = stream.get_remaining_buffer(3).unwrap();
        assert_eq!(head.as_bytes(), &[1, 2, 3]);
        // one byte left in this bucket, a 2-byte view must fail
        assert!(stream.get_remaining_buffer(2).is_none());
        let mut rest = [0u8; 3];
        stream.read_bytes(&mut rest).unwrap();
        assert_eq!(rest, [4, 5, 6]);
    }

    #[test]
    fn size_prefixed_redundancy_check() {
        let mut good = (4u64).to_le_bytes().to_vec();
        good.extend([9, 9, 9, 9]);
        let bucket = RawBucket {
            uncompressed_size: 4,
            payload: BucketPayload::SizePrefixed(Region::new(Arc::new(good))),
        };
        let mut stream = InputStream::new(Replay {
            buckets: VecDeque::from([bucket]),
        });
        assert_eq!(stream.read::<u32>().unwrap(), u32::from_ne_bytes([9; 4]));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn bogus_length_prefix_is_rejected() {
        let data = encode(u64::MAX - 3);
        let mut stream = InputStream::new(Replay::raw(vec![data]));
        assert!(matches!(
            stream.read_vec::<u32>(),
            Err(StreamError::LengthOutOfBounds { .. })
        ));
    }
}
