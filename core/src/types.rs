use std::fmt;

use uuid::Uuid;

/// 128-bit unique process identifier. [`NodeId::ZERO`] is reserved for
/// "unknown / refused".
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const ZERO: NodeId = NodeId(Uuid::nil());

    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn from_u128(raw: u128) -> Self {
        NodeId(Uuid::from_u128(raw))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Ok(NodeId(Uuid::parse_str(text)?))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0.simple())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// 128-bit identifier of a distributed object.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId(Uuid::nil());

    pub fn random() -> Self {
        ObjectId(Uuid::new_v4())
    }

    pub fn from_u128(raw: u128) -> Self {
        ObjectId(Uuid::from_u128(raw))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0.simple())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// 128-bit object version.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Debug)]
pub struct Version(pub u128);

impl Version {
    /// Unmapped placeholder.
    pub const ZERO: Version = Version(0);
    /// First committed version.
    pub const FIRST: Version = Version(1);
    /// Unversioned data.
    pub const NONE: Version = Version(u128::MAX - 1);
    /// Track the master's latest committed version.
    pub const HEAD: Version = Version(u128::MAX);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Version::HEAD => write!(f, "HEAD"),
            Version::NONE => write!(f, "NONE"),
            other => write!(f, "{}", other.0),
        }
    }
}

/// (identifier, version) pair naming one state of one object.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ObjectVersion {
    pub id: ObjectId,
    pub version: Version,
}

impl ObjectVersion {
    pub const NONE: ObjectVersion = ObjectVersion {
        id: ObjectId::ZERO,
        version: Version::ZERO,
    };

    pub fn new(id: ObjectId, version: Version) -> Self {
        Self { id, version }
    }
}

/// Kind of a remote peer, exchanged during the handshake.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeKind {
    /// "No such node" in a GET_NODE_DATA reply.
    Invalid,
    Node,
}

impl NodeKind {
    pub fn to_wire(self) -> u32 {
        match self {
            NodeKind::Invalid => 0,
            NodeKind::Node => 1,
        }
    }

    pub fn from_wire(raw: u32) -> Option<NodeKind> {
        match raw {
            0 => Some(NodeKind::Invalid),
            1 => Some(NodeKind::Node),
            _ => None,
        }
    }
}

/// True when this host stores multi-byte scalars big-endian; exchanged in
/// the node info blob so receivers can arm their streams' swap flag.
pub const fn host_is_big_endian() -> bool {
    cfg!(target_endian = "big")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ids_are_zero() {
        assert!(NodeId::ZERO.is_zero());
        assert!(!NodeId::random().is_zero());
        assert!(ObjectId::ZERO.is_zero());
    }

    #[test]
    fn version_markers_are_distinct() {
        assert_ne!(Version::HEAD, Version::NONE);
        assert_ne!(Version::NONE, Version::ZERO);
        assert_eq!(Version::ZERO.next(), Version::FIRST);
    }

    #[test]
    fn node_kind_wire_round_trip() {
        for kind in [NodeKind::Invalid, NodeKind::Node] {
            assert_eq!(NodeKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(NodeKind::from_wire(77), None);
    }
}
