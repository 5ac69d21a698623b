//! Versioned object delivery: deferred dispatch of early deltas, version
//! sync ordering and child reconciliation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fresco_core::{
    deserialize_children, object_data_ostream, write_object_versions, ConnectionDescription,
    LocalNode, LocalNodeConfig, Node, NodeKind, Object, ObjectCommand, ObjectDataIStream,
    ObjectError, ObjectId, ObjectOwner, ObjectVersion, StreamState, TransportKind,
    TransportRegistry, Version,
};
use fresco_stream::{
    BucketOut, BucketPayload, BucketSink, BucketSource, CompressorRegistry, InputStream,
    OutputStream, RawBucket, Region, StreamError, COMPRESSOR_NONE,
};

fn launch(registry: &Arc<TransportRegistry>, port: u16) -> Arc<LocalNode> {
    let mut config = LocalNodeConfig::default();
    config.transports = Arc::clone(registry);
    config.listen = vec![ConnectionDescription::new(
        TransportKind::Pipe,
        "node",
        port,
    )];
    let local = LocalNode::new(config);
    local.listen().unwrap();
    local
}

fn replica(of: &Arc<LocalNode>) -> Arc<Node> {
    Node::with_descriptions(of.id(), NodeKind::Node, of.self_node().descriptions())
}

fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

struct TestObject {
    id: Mutex<ObjectId>,
    data: Mutex<Vec<u8>>,
    unpacked: AtomicUsize,
}

impl TestObject {
    fn new(id: ObjectId) -> Arc<TestObject> {
        Arc::new(TestObject {
            id: Mutex::new(id),
            data: Mutex::new(Vec::new()),
            unpacked: AtomicUsize::new(0),
        })
    }

    fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Object for TestObject {
    fn id(&self) -> ObjectId {
        *self.id.lock().unwrap()
    }

    fn set_id(&self, id: ObjectId) {
        *self.id.lock().unwrap() = id;
    }

    fn unpack(&self, stream: &mut ObjectDataIStream) -> Result<(), ObjectError> {
        let bytes = stream.stream_mut().read_vec::<u8>()?;
        *self.data.lock().unwrap() = bytes;
        self.unpacked.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

fn send_version(
    sender: &Arc<Node>,
    object_id: ObjectId,
    version: Version,
    payload: &[u8],
) {
    let connection = sender.outgoing().expect("no outgoing connection");
    let mut stream = object_data_ostream(
        connection,
        ObjectCommand::Delta,
        object_id,
        0,
        version,
        None,
    );
    stream.write_vec(payload).unwrap();
    stream.finish().unwrap();
}

#[test]
fn deferred_delta_redispatches_after_map() {
    let registry = Arc::new(TransportRegistry::with_defaults());
    let sender = launch(&registry, 9301);
    let receiver = launch(&registry, 9302);

    let peer = sender.connect_node(replica(&receiver)).expect("connect");
    let object_id = ObjectId::random();
    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

    // the delta arrives before the object is mapped and must be deferred
    send_version(&peer, object_id, Version(1), &payload);
    assert!(poll_until(Duration::from_secs(2), || receiver
        .pending_command_count()
        > 0));
    assert!(receiver.object_store().stream_state(object_id).is_none());

    // mapping drains the pending list and completes the stream
    let object = TestObject::new(ObjectId::ZERO);
    receiver
        .map_object(Arc::clone(&object) as Arc<dyn Object>, object_id, Version::ZERO, None)
        .unwrap();
    assert!(poll_until(Duration::from_secs(2), || {
        receiver.object_store().stream_state(object_id) == Some(StreamState::Ready)
    }));
    assert_eq!(receiver.pending_command_count(), 0);

    let synced = receiver.sync_object(object_id, Version::HEAD).unwrap();
    assert_eq!(synced, Version(1));
    assert_eq!(object.data(), payload);
    assert_eq!(object.unpacked.load(Ordering::Acquire), 1);

    assert!(sender.close());
    assert!(receiver.close());
}

#[test]
fn sync_applies_versions_in_order() {
    let registry = Arc::new(TransportRegistry::with_defaults());
    let sender = launch(&registry, 9311);
    let receiver = launch(&registry, 9312);

    let peer = sender.connect_node(replica(&receiver)).expect("connect");
    let object_id = ObjectId::random();

    let object = TestObject::new(ObjectId::ZERO);
    receiver
        .map_object(Arc::clone(&object) as Arc<dyn Object>, object_id, Version::ZERO, None)
        .unwrap();

    let first = vec![1u8; 64];
    let second = vec![2u8; 64];
    send_version(&peer, object_id, Version(1), &first);
    send_version(&peer, object_id, Version(2), &second);

    assert!(poll_until(Duration::from_secs(2), || {
        receiver.object_store().pending_version(object_id) == Some(Version(2))
    }));

    // syncing to version 1 leaves version 2 queued
    assert_eq!(receiver.sync_object(object_id, Version(1)).unwrap(), Version(1));
    assert_eq!(object.data(), first);

    assert_eq!(
        receiver.sync_object(object_id, Version::HEAD).unwrap(),
        Version(2)
    );
    assert_eq!(object.data(), second);
    assert_eq!(object.unpacked.load(Ordering::Acquire), 2);

    assert!(sender.close());
    assert!(receiver.close());
}

// ---------------------------------------------------------------------
// child reconciliation
// ---------------------------------------------------------------------

/// Buffers buckets in memory and replays them as a source.
#[derive(Default)]
struct Loopback {
    buckets: VecDeque<(u32, u64, Vec<u8>)>,
}

impl BucketSink for Loopback {
    fn send_bucket(&mut self, bucket: BucketOut<'_>) -> Result<(), StreamError> {
        self.buckets.push_back((
            bucket.compressor,
            bucket.uncompressed_size,
            bucket.payload.to_vec(),
        ));
        Ok(())
    }
}

impl BucketSource for Loopback {
    fn next_bucket(&mut self) -> Result<Option<RawBucket>, StreamError> {
        let Some((compressor, uncompressed_size, payload)) = self.buckets.pop_front() else {
            return Ok(None);
        };
        assert_eq!(compressor, COMPRESSOR_NONE);
        Ok(Some(RawBucket {
            payload: BucketPayload::SizePrefixed(Region::new(Arc::new(payload))),
            uncompressed_size,
        }))
    }

    fn remaining_buckets(&self) -> usize {
        self.buckets.len()
    }
}

struct TestOwner {
    created: Mutex<Vec<Arc<dyn Object>>>,
    released: Mutex<Vec<ObjectId>>,
}

impl TestOwner {
    fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }
}

impl ObjectOwner for TestOwner {
    fn is_master(&self) -> bool {
        false
    }

    fn create_child(&self) -> Arc<dyn Object> {
        let child: Arc<dyn Object> = TestObject::new(ObjectId::ZERO);
        self.created.lock().unwrap().push(Arc::clone(&child));
        child
    }

    fn release_child(&self, child: &Arc<dyn Object>) {
        self.released.lock().unwrap().push(child.id());
    }
}

#[test]
fn child_reconciliation() {
    let registry = Arc::new(TransportRegistry::with_defaults());
    let local = LocalNode::new(LocalNodeConfig {
        transports: registry,
        ..LocalNodeConfig::default()
    });

    let ids: Vec<ObjectId> = (1..=4u128).map(ObjectId::from_u128).collect();
    let old_children: Vec<Arc<TestObject>> =
        ids[..3].iter().map(|id| TestObject::new(*id)).collect();
    for child in &old_children {
        local
            .map_object(
                Arc::clone(child) as Arc<dyn Object>,
                child.id(),
                Version::ZERO,
                None,
            )
            .unwrap();
    }

    // serialized child list: [(2, v2), (ZERO, _), (4, v4), (1, v1)]
    let incoming = vec![
        ObjectVersion::new(ids[1], Version(2)),
        ObjectVersion::NONE,
        ObjectVersion::new(ids[3], Version(4)),
        ObjectVersion::new(ids[0], Version(1)),
    ];
    let mut out = OutputStream::new(Loopback::default());
    write_object_versions(&mut out, &incoming).unwrap();
    out.finish().unwrap();
    let sink = std::mem::take(out.sink_mut());

    let mut input = InputStream::new(sink)
        .with_registry(Arc::new(CompressorRegistry::with_defaults()));

    let owner = TestOwner::new();
    let old: Vec<Option<Arc<dyn Object>>> = old_children
        .iter()
        .map(|child| Some(Arc::clone(child) as Arc<dyn Object>))
        .collect();

    let result = deserialize_children(&mut input, &local, &owner, &old).unwrap();

    // stream order: [B, null, newly created 4, A]
    assert_eq!(result.len(), 4);
    assert_eq!(result[0].as_ref().unwrap().id(), ids[1]);
    assert!(result[1].is_none());
    assert_eq!(result[2].as_ref().unwrap().id(), ids[3]);
    assert_eq!(result[3].as_ref().unwrap().id(), ids[0]);

    // the new child was created through the owner and mapped to v4
    assert_eq!(owner.created.lock().unwrap().len(), 1);
    assert!(local.object_store().is_attached(ids[3]));
    assert_eq!(local.object_store().object_version(ids[3]), Some(Version(4)));

    // C was unmapped and released
    assert_eq!(owner.released.lock().unwrap().as_slice(), &[ids[2]]);
    assert!(!local.object_store().is_attached(ids[2]));

    // survivors stay attached
    assert!(local.object_store().is_attached(ids[0]));
    assert!(local.object_store().is_attached(ids[1]));
}
