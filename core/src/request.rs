//! Request handles: block a caller until a handler on another thread
//! posts the result, with timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::node::Node;
use crate::packet::UNDEFINED_REQUEST;

pub type RequestId = u32;

/// Result a handler posts into a request slot.
#[derive(Clone, Debug)]
pub enum RequestValue {
    Unit,
    Bool(bool),
    /// A resolved peer, `None` when the queried node is unknown.
    Node(Option<Arc<Node>>),
}

impl PartialEq for RequestValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RequestValue::Unit, RequestValue::Unit) => true,
            (RequestValue::Bool(a), RequestValue::Bool(b)) => a == b,
            (RequestValue::Node(a), RequestValue::Node(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("request was never registered")]
    Unknown,
}

struct Slot {
    value: Option<RequestValue>,
    data: Option<Arc<Node>>,
}

/// An id → slot map; callers register, a handler serves, the caller's
/// wait returns the value (or times out and reclaims the slot).
pub struct RequestHandler {
    slots: Mutex<HashMap<RequestId, Slot>>,
    served: Condvar,
    next_id: AtomicU32,
}

impl RequestHandler {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            served: Condvar::new(),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn register(&self) -> RequestId {
        self.register_slot(None)
    }

    /// Register with a node attached; handlers retrieve it with
    /// [`RequestHandler::data`].
    pub fn register_with_data(&self, data: Arc<Node>) -> RequestId {
        self.register_slot(Some(data))
    }

    fn register_slot(&self, data: Option<Arc<Node>>) -> RequestId {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == 0 || id == UNDEFINED_REQUEST {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        self.slots.lock().insert(id, Slot { value: None, data });
        id
    }

    /// Post the result for `id`, waking its waiter. Serving an unknown or
    /// already-timed-out request is reported and ignored.
    pub fn serve(&self, id: RequestId, value: RequestValue) {
        let mut slots = self.slots.lock();
        match slots.get_mut(&id) {
            Some(slot) => {
                slot.value = Some(value);
                self.served.notify_all();
            }
            None => warn!("serving unknown request {id}"),
        }
    }

    /// The node attached at registration time.
    pub fn data(&self, id: RequestId) -> Option<Arc<Node>> {
        self.slots.lock().get(&id).and_then(|slot| slot.data.clone())
    }

    /// Block until `id` is served; `None` waits forever.
    pub fn wait(&self, id: RequestId, timeout: Option<Duration>) -> Result<RequestValue, RequestError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slots = self.slots.lock();
        loop {
            match slots.get_mut(&id) {
                None => return Err(RequestError::Unknown),
                Some(slot) => {
                    if let Some(value) = slot.value.take() {
                        slots.remove(&id);
                        return Ok(value);
                    }
                }
            }
            match deadline {
                None => self.served.wait(&mut slots),
                Some(deadline) => {
                    if self.served.wait_until(&mut slots, deadline).timed_out() {
                        slots.remove(&id);
                        return Err(RequestError::Timeout);
                    }
                }
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.slots.lock().is_empty()
    }
}

impl Default for RequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::types::{NodeId, NodeKind};

    #[test]
    fn serve_unblocks_waiter() {
        let handler = Arc::new(RequestHandler::new());
        let id = handler.register();
        let server = Arc::clone(&handler);
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            server.serve(id, RequestValue::Bool(true));
        });
        let value = handler.wait(id, Some(Duration::from_secs(2))).unwrap();
        assert!(matches!(value, RequestValue::Bool(true)));
        assert!(!handler.has_pending());
        join.join().unwrap();
    }

    #[test]
    fn timeout_reclaims_slot() {
        let handler = RequestHandler::new();
        let id = handler.register();
        assert_eq!(
            handler.wait(id, Some(Duration::from_millis(10))),
            Err(RequestError::Timeout)
        );
        assert!(!handler.has_pending());
        // a late serve is ignored
        handler.serve(id, RequestValue::Unit);
    }

    #[test]
    fn request_data_is_retrievable() {
        let handler = RequestHandler::new();
        let node = Node::new(NodeId::random(), NodeKind::Node);
        let id = handler.register_with_data(Arc::clone(&node));
        assert_eq!(handler.data(id).unwrap().id(), node.id());
        handler.serve(id, RequestValue::Unit);
        handler.wait(id, None).unwrap();
        assert!(handler.data(id).is_none());
    }
}
