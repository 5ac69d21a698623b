//! Remote peer bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::connection::{Connection, ConnectionDescription};
use crate::error::NodeError;
use crate::types::{host_is_big_endian, NodeId, NodeKind};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeState {
    Closed,
    Connecting,
    Connected,
    Listening,
    Closing,
}

/// The elected outgoing multicast connection plus auxiliary groups the
/// peer can still receive on.
#[derive(Default)]
pub struct MulticastState {
    pub elected: Option<Arc<dyn Connection>>,
    pub groups: Vec<Arc<dyn Connection>>,
}

/// The parsed node info blob exchanged during the handshake: identity,
/// byte order and the peer's connection descriptions.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub kind: NodeKind,
    pub big_endian: bool,
    pub descriptions: Vec<ConnectionDescription>,
}

impl NodeInfo {
    pub fn serialize(&self) -> String {
        let mut out = format!(
            "{} {} {} {}",
            self.id,
            self.kind.to_wire(),
            u8::from(self.big_endian),
            self.descriptions.len()
        );
        for description in &self.descriptions {
            out.push(' ');
            out.push_str(&description.to_string());
        }
        out
    }

    pub fn parse(text: &str) -> Option<NodeInfo> {
        let mut tokens = text.split_whitespace();
        let id: NodeId = tokens.next()?.parse().ok()?;
        let kind = NodeKind::from_wire(tokens.next()?.parse().ok()?)?;
        let big_endian = tokens.next()? == "1";
        let count: usize = tokens.next()?.parse().ok()?;
        let mut descriptions = Vec::with_capacity(count);
        for _ in 0..count {
            descriptions.push(ConnectionDescription::from_str_with_port(tokens.next()?, 0)?);
        }
        Some(NodeInfo {
            id,
            kind,
            big_endian,
            descriptions,
        })
    }
}

/// A remote peer of the local node.
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    big_endian: AtomicBool,
    state: Mutex<NodeState>,
    outgoing: Mutex<Option<Arc<dyn Connection>>>,
    multicast: Mutex<MulticastState>,
    descriptions: RwLock<Vec<ConnectionDescription>>,
    last_receive: AtomicI64,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind) -> Arc<Node> {
        Arc::new(Node {
            id,
            kind,
            big_endian: AtomicBool::new(host_is_big_endian()),
            state: Mutex::new(NodeState::Closed),
            outgoing: Mutex::new(None),
            multicast: Mutex::new(MulticastState::default()),
            descriptions: RwLock::new(Vec::new()),
            last_receive: AtomicI64::new(0),
        })
    }

    pub fn with_descriptions(
        id: NodeId,
        kind: NodeKind,
        descriptions: Vec<ConnectionDescription>,
    ) -> Arc<Node> {
        let node = Self::new(id, kind);
        *node.descriptions.write() = descriptions;
        node
    }

    pub fn from_info(info: &NodeInfo) -> Arc<Node> {
        let node = Self::with_descriptions(info.id, info.kind, info.descriptions.clone());
        node.big_endian.store(info.big_endian, Ordering::Release);
        node
    }

    /// Adopt byte order and descriptions from a handshake blob; the
    /// identity must match.
    pub fn apply_info(&self, info: &NodeInfo) -> bool {
        if info.id != self.id {
            return false;
        }
        self.big_endian.store(info.big_endian, Ordering::Release);
        *self.descriptions.write() = info.descriptions.clone();
        true
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            kind: self.kind,
            big_endian: self.big_endian.load(Ordering::Acquire),
            descriptions: self.descriptions(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// True when this peer stores scalars big-endian; object payload
    /// streams from it swap when the orders differ.
    pub fn is_big_endian(&self) -> bool {
        self.big_endian.load(Ordering::Acquire)
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), NodeState::Connected | NodeState::Listening)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NodeState::Closed
    }

    pub fn outgoing(&self) -> Option<Arc<dyn Connection>> {
        self.outgoing.lock().clone()
    }

    pub fn set_outgoing(&self, connection: Arc<dyn Connection>) {
        *self.outgoing.lock() = Some(connection);
    }

    pub fn take_outgoing(&self) -> Option<Arc<dyn Connection>> {
        self.outgoing.lock().take()
    }

    /// Send one framed packet over the unicast connection.
    pub fn send(&self, frame: &[u8]) -> Result<(), NodeError> {
        let connection = self.outgoing().ok_or(NodeError::NotConnected)?;
        connection.send(frame)?;
        Ok(())
    }

    /// Run `f` under the per-node multicast lock.
    pub fn with_multicast<R>(&self, f: impl FnOnce(&mut MulticastState) -> R) -> R {
        f(&mut self.multicast.lock())
    }

    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.descriptions.read().clone()
    }

    pub fn add_description(&self, description: ConnectionDescription) {
        self.descriptions.write().push(description);
    }

    pub fn remove_description(&self, description: &ConnectionDescription) -> bool {
        let mut descriptions = self.descriptions.write();
        let before = descriptions.len();
        descriptions.retain(|d| d != description);
        descriptions.len() != before
    }

    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Acquire)
    }

    pub fn set_last_receive(&self, when: i64) {
        self.last_receive.store(when, Ordering::Release);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} {:?})", self.id, self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportKind;

    #[test]
    fn info_blob_round_trip() {
        let info = NodeInfo {
            id: NodeId::random(),
            kind: NodeKind::Node,
            big_endian: false,
            descriptions: vec![
                ConnectionDescription::new(TransportKind::Tcp, "render1", 7777),
                ConnectionDescription::new(TransportKind::Multicast, "239.1.2.3", 4242),
            ],
        };
        let text = info.serialize();
        assert_eq!(NodeInfo::parse(&text), Some(info));
    }

    #[test]
    fn info_blob_rejects_truncation() {
        let info = Node::new(NodeId::random(), NodeKind::Node).info();
        let text = info.serialize();
        assert!(NodeInfo::parse(&text[..text.len() - 1]).is_none());
        assert!(NodeInfo::parse("garbage").is_none());
    }

    #[test]
    fn apply_info_checks_identity() {
        let node = Node::new(NodeId::random(), NodeKind::Node);
        let mut foreign = node.info();
        foreign.id = NodeId::random();
        assert!(!node.apply_info(&foreign));

        let mut own = node.info();
        own.descriptions
            .push(ConnectionDescription::new(TransportKind::Tcp, "h", 1));
        assert!(node.apply_info(&own));
        assert_eq!(node.descriptions().len(), 1);
    }
}
