//! Distributed objects and child reconciliation.

use std::sync::Arc;

use log::warn;

use fresco_stream::{BucketSink, BucketSource, InputStream, OutputStream, StreamError};

use crate::error::ObjectError;
use crate::local_node::LocalNode;
use crate::object_stream::ObjectDataIStream;
use crate::types::{ObjectId, ObjectVersion, Version};

/// One replica of a versioned distributed object.
pub trait Object: Send + Sync {
    fn id(&self) -> ObjectId;

    /// Called when the runtime assigns the identity, e.g. on mapping a
    /// freshly created child.
    fn set_id(&self, _id: ObjectId) {}

    /// Apply one complete incoming version.
    fn unpack(&self, stream: &mut ObjectDataIStream) -> Result<(), ObjectError>;
}

/// The parent in a child reconciliation: allocates unknown children and
/// takes back removed ones.
pub trait ObjectOwner {
    fn is_master(&self) -> bool;

    fn create_child(&self) -> Arc<dyn Object>;

    fn release_child(&self, child: &Arc<dyn Object>);
}

/// Read a flat, length-prefixed list of (id, version) pairs.
pub fn read_object_versions<S: BucketSource>(
    stream: &mut InputStream<S>,
) -> Result<Vec<ObjectVersion>, StreamError> {
    let raw = stream.read_vec::<u128>()?;
    if raw.len() % 2 != 0 {
        return Err(StreamError::LengthOutOfBounds {
            elements: raw.len() as u64,
        });
    }
    Ok(raw
        .chunks_exact(2)
        .map(|pair| ObjectVersion::new(ObjectId::from_u128(pair[0]), Version(pair[1])))
        .collect())
}

/// Write the flat list [`read_object_versions`] expects, as one operation.
pub fn write_object_versions<K: BucketSink>(
    stream: &mut OutputStream<K>,
    versions: &[ObjectVersion],
) -> Result<(), StreamError> {
    let mut raw = Vec::with_capacity(versions.len() * 2);
    for entry in versions {
        raw.push(entry.id.as_u128());
        raw.push(entry.version.0);
    }
    stream.write_vec(&raw)
}

/// Merge a serialized child list into `old`, producing the new children in
/// stream order.
///
/// A ZERO id yields a null slot. A known id is moved over and synced, to
/// HEAD when the owner is the master, else to the serialized version. An
/// unknown id gets a freshly created child mapped to (id, version).
/// Children left in `old` are unmapped (when attached and not master) and
/// released to the owner. `old` is snapshotted first, so callers may feed
/// the same vector they assign the result to.
pub fn deserialize_children<S: BucketSource>(
    stream: &mut InputStream<S>,
    local: &LocalNode,
    owner: &dyn ObjectOwner,
    old: &[Option<Arc<dyn Object>>],
) -> Result<Vec<Option<Arc<dyn Object>>>, ObjectError> {
    let versions = read_object_versions(stream)?;
    let mut old: Vec<Option<Arc<dyn Object>>> = old.to_vec();

    let mut result = Vec::with_capacity(versions.len());
    for entry in versions {
        if entry.id.is_zero() {
            result.push(None);
            continue;
        }

        let known = old.iter().position(|slot| {
            slot.as_ref()
                .map(|child| child.id() == entry.id)
                .unwrap_or(false)
        });
        match known {
            Some(index) => {
                let child = old.remove(index);
                let target = if owner.is_master() {
                    Version::HEAD
                } else {
                    entry.version
                };
                local.sync_object(entry.id, target)?;
                result.push(child);
            }
            None => {
                // previously unknown child
                let child = owner.create_child();
                debug_assert!(!owner.is_master(), "master deserializing unknown child");
                local.map_object(Arc::clone(&child), entry.id, entry.version, None)?;
                result.push(Some(child));
            }
        }
    }

    // removed children
    while let Some(slot) = old.pop() {
        let Some(child) = slot else { continue };
        let id = child.id();
        if local.object_store().is_attached(id) && !local.object_store().is_master(id) {
            if let Err(e) = local.unmap_object(id) {
                warn!("unmap of removed child {id} failed: {e}");
            }
        }
        owner.release_child(&child);
    }

    Ok(result)
}
