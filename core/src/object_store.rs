//! The identifier → attachment map feeding object data streams.
//!
//! OBJECT packets route here from the receiver thread: a mapped object's
//! accumulating stream absorbs them, complete versions queue up for sync,
//! and packets for unmapped objects are deferred back to the pending list.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, trace, warn};
use parking_lot::Mutex;

use fresco_stream::CompressorRegistry;

use crate::command::Command;
use crate::error::ObjectError;
use crate::object::Object;
use crate::object_stream::{ObjectDataIStream, StreamState};
use crate::packet::ObjectDataPayload;
use crate::types::{NodeId, ObjectId, Version};

struct Attachment {
    object: Arc<dyn Object>,
    master: bool,
    master_node: Option<NodeId>,
    accumulating: ObjectDataIStream,
    ready: VecDeque<ObjectDataIStream>,
    version: Version,
}

/// Manager of attached distributed objects.
pub struct ObjectStore {
    registry: Arc<CompressorRegistry>,
    attachments: Mutex<HashMap<ObjectId, Attachment>>,
    send_on_register: AtomicBool,
}

impl ObjectStore {
    pub fn new(registry: Arc<CompressorRegistry>) -> Self {
        Self {
            registry,
            attachments: Mutex::new(HashMap::new()),
            send_on_register: AtomicBool::new(false),
        }
    }

    /// Attach the master replica of `object`. A zero id gets a fresh one.
    pub fn register_object(&self, object: Arc<dyn Object>) -> Result<ObjectId, ObjectError> {
        let mut id = object.id();
        if id.is_zero() {
            id = ObjectId::random();
            object.set_id(id);
        }
        self.attach(object, id, Version::FIRST, true, None)?;
        Ok(id)
    }

    pub fn deregister_object(&self, id: ObjectId) -> Result<(), ObjectError> {
        self.detach(id, true)
    }

    /// Attach a slave replica of `object` under `id`.
    pub fn map_object(
        &self,
        object: Arc<dyn Object>,
        id: ObjectId,
        version: Version,
        master_node: Option<NodeId>,
    ) -> Result<(), ObjectError> {
        object.set_id(id);
        self.attach(object, id, version, false, master_node)
    }

    pub fn unmap_object(&self, id: ObjectId) -> Result<(), ObjectError> {
        self.detach(id, false)
    }

    fn attach(
        &self,
        object: Arc<dyn Object>,
        id: ObjectId,
        version: Version,
        master: bool,
        master_node: Option<NodeId>,
    ) -> Result<(), ObjectError> {
        let mut attachments = self.attachments.lock();
        if attachments.contains_key(&id) {
            return Err(ObjectError::AlreadyAttached(id));
        }
        attachments.insert(
            id,
            Attachment {
                object,
                master,
                master_node,
                accumulating: ObjectDataIStream::new(Arc::clone(&self.registry)),
                ready: VecDeque::new(),
                version,
            },
        );
        Ok(())
    }

    fn detach(&self, id: ObjectId, master: bool) -> Result<(), ObjectError> {
        let mut attachments = self.attachments.lock();
        match attachments.get(&id) {
            None => Err(ObjectError::NotAttached(id)),
            Some(attachment) => {
                debug_assert_eq!(attachment.master, master, "master/slave detach mismatch");
                attachments.remove(&id);
                Ok(())
            }
        }
    }

    pub fn is_attached(&self, id: ObjectId) -> bool {
        self.attachments.lock().contains_key(&id)
    }

    pub fn is_master(&self, id: ObjectId) -> bool {
        self.attachments
            .lock()
            .get(&id)
            .map(|a| a.master)
            .unwrap_or(false)
    }

    pub fn object_version(&self, id: ObjectId) -> Option<Version> {
        self.attachments.lock().get(&id).map(|a| a.version)
    }

    /// Version accumulating or most recently queued for `id`.
    pub fn pending_version(&self, id: ObjectId) -> Option<Version> {
        self.attachments.lock().get(&id).map(|attachment| {
            let pending = attachment.accumulating.pending_version();
            if pending != Version::NONE {
                pending
            } else {
                attachment
                    .ready
                    .back()
                    .map(|s| s.version())
                    .unwrap_or(Version::NONE)
            }
        })
    }

    pub fn stream_state(&self, id: ObjectId) -> Option<StreamState> {
        self.attachments.lock().get(&id).map(|attachment| {
            if !attachment.ready.is_empty() {
                StreamState::Ready
            } else {
                attachment.accumulating.state()
            }
        })
    }

    /// Route one OBJECT packet. Returns false (defer) when the object is
    /// not mapped yet; the receiver keeps the command pending.
    pub fn dispatch_object_command(&self, command: &mut Command) -> bool {
        let header = match ObjectDataPayload::peek(command) {
            Ok(header) => header,
            Err(e) => {
                error!("unreadable object data packet: {e}");
                debug_assert!(false, "malformed object data packet");
                return true;
            }
        };
        let mut attachments = self.attachments.lock();
        let Some(attachment) = attachments.get_mut(&header.object_id) else {
            trace!("no object {} attached, deferring", header.object_id);
            return false;
        };
        if let Err(e) = attachment.accumulating.add_data_packet(command.clone()) {
            error!("dropping object data packet: {e}");
            return true;
        }
        if attachment.accumulating.is_ready() {
            let complete = std::mem::replace(
                &mut attachment.accumulating,
                ObjectDataIStream::new(Arc::clone(&self.registry)),
            );
            trace!(
                "version {} of {} complete",
                complete.version(),
                header.object_id
            );
            attachment.ready.push_back(complete);
        }
        true
    }

    /// Apply queued complete versions up to `target` through
    /// [`Object::unpack`]; [`Version::HEAD`] drains everything queued.
    pub fn sync_object(&self, id: ObjectId, target: Version) -> Result<Version, ObjectError> {
        loop {
            let (object, mut stream) = {
                let mut attachments = self.attachments.lock();
                let attachment = attachments
                    .get_mut(&id)
                    .ok_or(ObjectError::NotAttached(id))?;
                let take = match attachment.ready.front() {
                    Some(next) => target == Version::HEAD || next.version() <= target,
                    None => false,
                };
                if !take {
                    return Ok(attachment.version);
                }
                let Some(stream) = attachment.ready.pop_front() else {
                    return Ok(attachment.version);
                };
                (Arc::clone(&attachment.object), stream)
            };
            // unpack outside the lock: object code may map children
            object.unpack(&mut stream)?;
            let applied = stream.version();
            if let Some(attachment) = self.attachments.lock().get_mut(&id) {
                attachment.version = applied;
            }
        }
    }

    /// A peer went away: drop half-assembled versions it mastered.
    pub fn remove_node(&self, node: NodeId) {
        let mut attachments = self.attachments.lock();
        for (id, attachment) in attachments.iter_mut() {
            if attachment.master_node == Some(node)
                && attachment.accumulating.state() == StreamState::Accumulating
            {
                warn!("dropping partial version of {id} from disconnected {node}");
                attachment.accumulating.reset();
            }
        }
    }

    pub fn enable_send_on_register(&self) {
        self.send_on_register.store(true, Ordering::Release);
    }

    pub fn disable_send_on_register(&self) {
        self.send_on_register.store(false, Ordering::Release);
    }

    /// Whether newly registered objects push their initial version to
    /// existing subscribers.
    pub fn send_on_register(&self) -> bool {
        self.send_on_register.load(Ordering::Acquire)
    }

    /// Idle hook run by the command thread; true requests another pass.
    pub fn notify_idle(&self) -> bool {
        false
    }

    /// Detach everything at teardown.
    pub fn clear(&self) {
        let mut attachments = self.attachments.lock();
        if !attachments.is_empty() {
            warn!("{} objects attached during cleanup", attachments.len());
        }
        attachments.clear();
    }

    pub fn attached_count(&self) -> usize {
        self.attachments.lock().len()
    }
}
