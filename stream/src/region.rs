use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Backing storage for a [`Region`]. Implemented by the runtime's pooled
/// buffers and by plain vectors holding decompressed bucket data.
pub trait ByteStore: Send + Sync + 'static {
    fn as_bytes(&self) -> &[u8];
}

impl ByteStore for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

/// A cheaply cloneable view of a range of shared immutable bytes.
///
/// Buckets handed to an [`crate::InputStream`] are regions; cloning a
/// region keeps the backing store alive, so a consumer may outlive the
/// command that delivered the bytes.
#[derive(Clone)]
pub struct Region {
    store: Arc<dyn ByteStore>,
    start: usize,
    end: usize,
}

impl Region {
    /// View over the whole store.
    pub fn new(store: Arc<dyn ByteStore>) -> Self {
        let end = store.as_bytes().len();
        Self {
            store,
            start: 0,
            end,
        }
    }

    /// View over `range` of the store.
    ///
    /// # Panics
    /// Panics if `range` is out of bounds; regions are only constructed
    /// from trusted, already-validated offsets.
    pub fn with_range(store: Arc<dyn ByteStore>, range: Range<usize>) -> Self {
        assert!(range.start <= range.end && range.end <= store.as_bytes().len());
        Self {
            store,
            start: range.start,
            end: range.end,
        }
    }

    /// Sub-view, with `range` relative to this region.
    pub fn slice(&self, range: Range<usize>) -> Region {
        assert!(range.start <= range.end && range.end <= self.len());
        Region {
            store: Arc::clone(&self.store),
            start: self.start + range.start,
            end: self.start + range.end,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.store.as_bytes()[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::Region;
    use std::sync::Arc;

    #[test]
    fn slice_is_relative() {
        let region = Region::new(Arc::new(vec![0u8, 1, 2, 3, 4, 5, 6, 7]));
        let mid = region.slice(2..6);
        assert_eq!(mid.as_bytes(), &[2, 3, 4, 5]);
        let inner = mid.slice(1..3);
        assert_eq!(inner.as_bytes(), &[3, 4]);
    }

    #[test]
    fn clone_shares_store() {
        let region = Region::new(Arc::new(vec![9u8; 16]));
        let copy = region.clone();
        drop(region);
        assert_eq!(copy.len(), 16);
        assert_eq!(copy.as_bytes()[0], 9);
    }
}
