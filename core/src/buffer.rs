//! Pooled byte buffers backing every received command.
//!
//! The cache hands out zeroed buffers from per-size-class freelists;
//! storage returns to its freelist when the last reference drops. A
//! buffer moves FREE → ALLOCATED on alloc and ALLOCATED → VALID once its
//! frame data has been read in.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use fresco_stream::ByteStore;

const STATE_ALLOCATED: u8 = 1;
const STATE_VALID: u8 = 2;

/// Smallest pooled size class.
const MIN_CLASS: usize = 256;

/// A reference-counted byte region owned by a [`BufferCache`].
pub struct Buffer {
    data: Vec<u8>,
    state: AtomicU8,
    cache: Weak<CacheShared>,
}

impl Buffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True once the frame data has been fully read in.
    pub fn is_valid(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_VALID
    }
}

impl ByteStore for Buffer {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.release(std::mem::take(&mut self.data));
        }
    }
}

/// Exclusive handle to a buffer still being filled; [`BufferMut::freeze`]
/// turns it into the shared, immutable form.
pub struct BufferMut {
    buffer: Buffer,
}

impl BufferMut {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data
    }

    pub fn len(&self) -> usize {
        self.buffer.data.len()
    }

    pub fn freeze(self) -> Arc<Buffer> {
        self.buffer.state.store(STATE_VALID, Ordering::Release);
        Arc::new(self.buffer)
    }
}

struct CacheShared {
    pools: Mutex<Vec<(usize, Vec<Vec<u8>>)>>,
    outstanding: AtomicUsize,
}

impl CacheShared {
    fn release(&self, mut storage: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        storage.clear();
        let class = size_class(storage.capacity());
        let mut pools = self.pools.lock();
        match pools.binary_search_by_key(&class, |(c, _)| *c) {
            Ok(i) => pools[i].1.push(storage),
            Err(i) => pools.insert(i, (class, vec![storage])),
        }
    }
}

fn size_class(size: usize) -> usize {
    size.max(MIN_CLASS).next_power_of_two()
}

/// Hands out buffers sized to a requested byte count from per-size-class
/// freelists.
#[derive(Clone)]
pub struct BufferCache {
    shared: Arc<CacheShared>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CacheShared {
                pools: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// A zeroed buffer of exactly `size` bytes.
    pub fn alloc(&self, size: usize) -> BufferMut {
        let class = size_class(size);
        let mut storage = {
            let mut pools = self.shared.pools.lock();
            match pools.binary_search_by_key(&class, |(c, _)| *c) {
                Ok(i) => pools[i].1.pop().unwrap_or_default(),
                Err(_) => Vec::new(),
            }
        };
        storage.clear();
        storage.reserve(class.max(size));
        storage.resize(size, 0);
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        BufferMut {
            buffer: Buffer {
                data: storage,
                state: AtomicU8::new(STATE_ALLOCATED),
                cache: Arc::downgrade(&self.shared),
            },
        }
    }

    /// Adopt an already-built frame, e.g. a synthesized command.
    pub fn adopt(&self, data: Vec<u8>) -> Arc<Buffer> {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        Arc::new(Buffer {
            data,
            state: AtomicU8::new(STATE_VALID),
            cache: Arc::downgrade(&self.shared),
        })
    }

    /// Buffers currently handed out (not FREE).
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Drop all pooled storage.
    pub fn flush(&self) {
        self.shared.pools.lock().clear();
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_release_returns_to_pool() {
        let cache = BufferCache::new();
        let mut staged = cache.alloc(100);
        assert_eq!(staged.len(), 100);
        staged.bytes_mut()[0] = 0xab;
        assert_eq!(cache.outstanding(), 1);

        let buffer = staged.freeze();
        assert!(buffer.is_valid());
        drop(buffer);
        assert_eq!(cache.outstanding(), 0);

        // same size class comes back from the freelist, zeroed
        let again = cache.alloc(80);
        assert_eq!(again.buffer.data[0], 0);
        assert_eq!(cache.outstanding(), 1);
    }

    #[test]
    fn shared_references_keep_storage_alive() {
        let cache = BufferCache::new();
        let buffer = cache.alloc(16).freeze();
        let second = Arc::clone(&buffer);
        drop(buffer);
        assert_eq!(cache.outstanding(), 1);
        drop(second);
        assert_eq!(cache.outstanding(), 0);
    }

    #[test]
    fn size_classes_round_up() {
        assert_eq!(size_class(1), MIN_CLASS);
        assert_eq!(size_class(300), 512);
        assert_eq!(size_class(512), 512);
    }
}
