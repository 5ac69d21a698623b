//! The wire format: length-prefixed frames carrying a flat command/type
//! pair and a per-variant payload.
//!
//! ```text
//! u64 size      total frame size including these 8 bytes (little-endian)
//! u32 command   packet command code
//! u32 type      packet type (NODE, OBJECT)
//! ...           command-specific payload
//! ```
//!
//! Control-packet scalars are little-endian on the wire. Object payload
//! *content* is written in the sender's native order; the receiving stream
//! swaps when the handshake advertised a different order.

use fresco_stream::StreamError;

use crate::command::Command;
use crate::types::{NodeId, NodeKind, ObjectId, Version};

/// Offset of the packet header behind the frame size.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Request id meaning "no acknowledgement wanted".
pub const UNDEFINED_REQUEST: u32 = u32::MAX;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketType {
    Node,
    Object,
}

impl PacketType {
    pub fn to_wire(self) -> u32 {
        match self {
            PacketType::Node => 1,
            PacketType::Object => 2,
        }
    }

    pub fn from_wire(raw: u32) -> Option<PacketType> {
        match raw {
            1 => Some(PacketType::Node),
            2 => Some(PacketType::Object),
            _ => None,
        }
    }
}

/// Connection-management and node-service commands.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum NodeCommand {
    AckRequest,
    StopRcv,
    StopCmd,
    Connect,
    ConnectReply,
    ConnectAck,
    Id,
    Disconnect,
    GetNodeData,
    GetNodeDataReply,
    AcquireSendToken,
    AcquireSendTokenReply,
    ReleaseSendToken,
    AddListener,
    RemoveListener,
    Ping,
    PingReply,
    RemoveNode,
}

impl NodeCommand {
    pub fn to_wire(self) -> u32 {
        match self {
            NodeCommand::AckRequest => 0,
            NodeCommand::StopRcv => 1,
            NodeCommand::StopCmd => 2,
            NodeCommand::Connect => 3,
            NodeCommand::ConnectReply => 4,
            NodeCommand::ConnectAck => 5,
            NodeCommand::Id => 6,
            NodeCommand::Disconnect => 7,
            NodeCommand::GetNodeData => 8,
            NodeCommand::GetNodeDataReply => 9,
            NodeCommand::AcquireSendToken => 10,
            NodeCommand::AcquireSendTokenReply => 11,
            NodeCommand::ReleaseSendToken => 12,
            NodeCommand::AddListener => 13,
            NodeCommand::RemoveListener => 14,
            NodeCommand::Ping => 15,
            NodeCommand::PingReply => 16,
            NodeCommand::RemoveNode => 17,
        }
    }

    pub fn from_wire(raw: u32) -> Option<NodeCommand> {
        Some(match raw {
            0 => NodeCommand::AckRequest,
            1 => NodeCommand::StopRcv,
            2 => NodeCommand::StopCmd,
            3 => NodeCommand::Connect,
            4 => NodeCommand::ConnectReply,
            5 => NodeCommand::ConnectAck,
            6 => NodeCommand::Id,
            7 => NodeCommand::Disconnect,
            8 => NodeCommand::GetNodeData,
            9 => NodeCommand::GetNodeDataReply,
            10 => NodeCommand::AcquireSendToken,
            11 => NodeCommand::AcquireSendTokenReply,
            12 => NodeCommand::ReleaseSendToken,
            13 => NodeCommand::AddListener,
            14 => NodeCommand::RemoveListener,
            15 => NodeCommand::Ping,
            16 => NodeCommand::PingReply,
            17 => NodeCommand::RemoveNode,
            _ => return None,
        })
    }
}

/// Versioned object data commands.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ObjectCommand {
    Instance,
    Delta,
    SlaveDelta,
}

impl ObjectCommand {
    pub fn to_wire(self) -> u32 {
        match self {
            ObjectCommand::Instance => 0,
            ObjectCommand::Delta => 1,
            ObjectCommand::SlaveDelta => 2,
        }
    }

    pub fn from_wire(raw: u32) -> Option<ObjectCommand> {
        match raw {
            0 => Some(ObjectCommand::Instance),
            1 => Some(ObjectCommand::Delta),
            2 => Some(ObjectCommand::SlaveDelta),
            _ => None,
        }
    }
}

/// Builds one frame: header fields little-endian, payload appended, size
/// patched in on [`FrameWriter::finish`].
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn node(command: NodeCommand) -> Self {
        Self::with_codes(command.to_wire(), PacketType::Node.to_wire())
    }

    pub fn object(command: ObjectCommand) -> Self {
        Self::with_codes(command.to_wire(), PacketType::Object.to_wire())
    }

    fn with_codes(command: u32, packet_type: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&command.to_le_bytes());
        buf.extend_from_slice(&packet_type.to_le_bytes());
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u128(&mut self, value: u128) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Length-prefixed text blob.
    pub fn put_text(&mut self, text: &str) -> &mut Self {
        self.put_u64(text.len() as u64);
        self.buf.extend_from_slice(text.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let size = self.buf.len() as u64;
        self.buf[..8].copy_from_slice(&size.to_le_bytes());
        self.buf
    }
}

// Per-variant payloads. Each knows how to read itself off a received
// command and how to frame itself for sending.

pub struct AckRequestPayload {
    pub request_id: u32,
}

impl AckRequestPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::AckRequest);
        w.put_u32(self.request_id);
        w.finish()
    }
}

pub struct ConnectPayload {
    pub request_id: u32,
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub info: String,
}

impl ConnectPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
            node_id: NodeId::from_u128(cmd.get::<u128>()?),
            kind: NodeKind::from_wire(cmd.get::<u32>()?).unwrap_or(NodeKind::Invalid),
            info: cmd.stream_mut().read_string()?,
        })
    }

    pub fn frame(&self, command: NodeCommand) -> Vec<u8> {
        let mut w = FrameWriter::node(command);
        w.put_u32(self.request_id)
            .put_u128(self.node_id.as_u128())
            .put_u32(self.kind.to_wire())
            .put_text(&self.info);
        w.finish()
    }
}

/// CONNECT_REPLY and GET_NODE_DATA_REPLY share this shape; a ZERO node id
/// in a connect reply means refusal.
pub type ConnectReplyPayload = ConnectPayload;

pub struct NodeIdPayload {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub info: String,
}

impl NodeIdPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            node_id: NodeId::from_u128(cmd.get::<u128>()?),
            kind: NodeKind::from_wire(cmd.get::<u32>()?).unwrap_or(NodeKind::Invalid),
            info: cmd.stream_mut().read_string()?,
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::Id);
        w.put_u128(self.node_id.as_u128())
            .put_u32(self.kind.to_wire())
            .put_text(&self.info);
        w.finish()
    }
}

pub struct DisconnectPayload {
    pub request_id: u32,
}

impl DisconnectPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::Disconnect);
        w.put_u32(self.request_id);
        w.finish()
    }
}

pub struct GetNodeDataPayload {
    pub request_id: u32,
    pub node_id: NodeId,
}

impl GetNodeDataPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
            node_id: NodeId::from_u128(cmd.get::<u128>()?),
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::GetNodeData);
        w.put_u32(self.request_id).put_u128(self.node_id.as_u128());
        w.finish()
    }
}

pub struct GetNodeDataReplyPayload {
    pub request_id: u32,
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub info: String,
}

impl GetNodeDataReplyPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
            node_id: NodeId::from_u128(cmd.get::<u128>()?),
            kind: NodeKind::from_wire(cmd.get::<u32>()?).unwrap_or(NodeKind::Invalid),
            info: cmd.stream_mut().read_string()?,
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::GetNodeDataReply);
        w.put_u32(self.request_id)
            .put_u128(self.node_id.as_u128())
            .put_u32(self.kind.to_wire())
            .put_text(&self.info);
        w.finish()
    }
}

pub struct SendTokenPayload {
    pub request_id: u32,
}

impl SendTokenPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
        })
    }

    pub fn frame(&self, command: NodeCommand) -> Vec<u8> {
        let mut w = FrameWriter::node(command);
        w.put_u32(self.request_id);
        w.finish()
    }
}

pub struct AddListenerPayload {
    pub token: u32,
    pub description: String,
}

impl AddListenerPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            token: cmd.get::<u32>()?,
            description: cmd.stream_mut().read_string()?,
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::AddListener);
        w.put_u32(self.token).put_text(&self.description);
        w.finish()
    }
}

pub struct RemoveListenerPayload {
    pub request_id: u32,
    pub token: u32,
    pub description: String,
}

impl RemoveListenerPayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            request_id: cmd.get::<u32>()?,
            token: cmd.get::<u32>()?,
            description: cmd.stream_mut().read_string()?,
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::RemoveListener);
        w.put_u32(self.request_id)
            .put_u32(self.token)
            .put_text(&self.description);
        w.finish()
    }
}

pub struct RemoveNodePayload {
    pub node_id: NodeId,
}

impl RemoveNodePayload {
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            node_id: NodeId::from_u128(cmd.get::<u128>()?),
        })
    }

    pub fn frame(&self) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::RemoveNode);
        w.put_u128(self.node_id.as_u128());
        w.finish()
    }
}

pub fn empty_node_frame(command: NodeCommand) -> Vec<u8> {
    FrameWriter::node(command).finish()
}

/// Header of OBJECT_DELTA / OBJECT_INSTANCE / OBJECT_SLAVE_DELTA packets;
/// the bucket payload follows it.
#[derive(Clone, Debug)]
pub struct ObjectDataPayload {
    pub object_id: ObjectId,
    pub instance_id: u32,
    pub sequence: u32,
    pub version: Version,
    pub compressor: u32,
    pub n_chunks: u32,
    pub data_size: u64,
    pub last: bool,
}

impl ObjectDataPayload {
    /// Read the header, leaving the command cursor at the bucket payload.
    pub fn read(cmd: &mut Command) -> Result<Self, StreamError> {
        Ok(Self {
            object_id: ObjectId::from_u128(cmd.get::<u128>()?),
            instance_id: cmd.get::<u32>()?,
            sequence: cmd.get::<u32>()?,
            version: Version(cmd.get::<u128>()?),
            compressor: cmd.get::<u32>()?,
            n_chunks: cmd.get::<u32>()?,
            data_size: cmd.get::<u64>()?,
            last: cmd.get::<u8>()? != 0,
        })
    }

    /// Read the header from a fresh cursor without consuming `cmd`.
    pub fn peek(cmd: &Command) -> Result<Self, StreamError> {
        let mut scratch = cmd.clone();
        Self::read(&mut scratch)
    }

    pub fn frame_with_payload(&self, command: ObjectCommand, payload: &[u8]) -> Vec<u8> {
        let mut w = FrameWriter::object(command);
        w.put_u128(self.object_id.as_u128())
            .put_u32(self.instance_id)
            .put_u32(self.sequence)
            .put_u128(self.version.0)
            .put_u32(self.compressor)
            .put_u32(self.n_chunks)
            .put_u64(self.data_size)
            .put_u8(u8::from(self.last))
            .put_bytes(payload);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for raw in 0..18 {
            let command = NodeCommand::from_wire(raw).unwrap();
            assert_eq!(command.to_wire(), raw);
        }
        assert!(NodeCommand::from_wire(99).is_none());
        for raw in 0..3 {
            assert_eq!(ObjectCommand::from_wire(raw).unwrap().to_wire(), raw);
        }
    }

    #[test]
    fn frame_size_is_patched() {
        let mut w = FrameWriter::node(NodeCommand::Ping);
        w.put_u32(0xabcd);
        let frame = w.finish();
        let size = u64::from_le_bytes(frame[..8].try_into().unwrap());
        assert_eq!(size as usize, frame.len());
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 4);
        let command = u32::from_le_bytes(frame[8..12].try_into().unwrap());
        assert_eq!(command, NodeCommand::Ping.to_wire());
        let ptype = u32::from_le_bytes(frame[12..16].try_into().unwrap());
        assert_eq!(ptype, PacketType::Node.to_wire());
    }
}
