//! Received packets, presented as typed deserialization cursors plus a
//! dispatch trigger.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fresco_stream::{
    BucketPayload, BucketSource, InputStream, RawBucket, Region, Scalar, StreamError,
};

use crate::buffer::{Buffer, BufferCache, BufferMut};
use crate::connection::Connection;
use crate::local_node::LocalNode;
use crate::node::Node;
use crate::packet::{NodeCommand, ObjectCommand, PacketType, FRAME_HEADER_SIZE};
use crate::types::host_is_big_endian;

/// A handler a command is dispatched to; returns true when the command was
/// consumed, false to defer it for redispatch.
pub type CommandFn = Arc<dyn Fn(&mut Command) -> bool + Send + Sync>;

/// Feeds a command's payload to its embedded stream as one raw bucket.
pub struct PayloadSource {
    region: Option<Region>,
}

impl BucketSource for PayloadSource {
    fn next_bucket(&mut self) -> Result<Option<RawBucket>, StreamError> {
        Ok(self.region.take().map(|region| RawBucket {
            uncompressed_size: region.len() as u64,
            payload: BucketPayload::Raw(region),
        }))
    }

    fn remaining_buckets(&self) -> usize {
        usize::from(self.region.is_some())
    }
}

struct OutstandingGuard(Arc<AtomicUsize>);

impl OutstandingGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Clone for OutstandingGuard {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A received packet: shares its buffer with any clones, carries the
/// sending node and originating connection, and reads typed values off the
/// payload behind the 16-byte frame header.
pub struct Command {
    buffer: Arc<Buffer>,
    node: Option<Arc<Node>>,
    local: Weak<LocalNode>,
    connection: Option<Arc<dyn Connection>>,
    stream: InputStream<PayloadSource>,
    dispatch: Option<CommandFn>,
    override_command: Option<u32>,
    _outstanding: OutstandingGuard,
}

impl Command {
    fn payload_stream(buffer: &Arc<Buffer>) -> InputStream<PayloadSource> {
        let len = buffer.len();
        let region = if len > FRAME_HEADER_SIZE {
            let store: Arc<dyn fresco_stream::ByteStore> = Arc::clone(buffer) as Arc<dyn fresco_stream::ByteStore>;
            Some(Region::with_range(store, FRAME_HEADER_SIZE..len))
        } else {
            None
        };
        let mut stream = InputStream::new(PayloadSource { region });
        // control fields are little-endian on the wire
        stream.set_swapping(host_is_big_endian());
        stream
    }

    fn header_u32(&self, offset: usize) -> u32 {
        let bytes = self.buffer.as_bytes();
        if bytes.len() < offset + 4 {
            return u32::MAX;
        }
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    /// The command code, honoring a re-dispatch override.
    pub fn command(&self) -> u32 {
        self.override_command.unwrap_or_else(|| self.header_u32(8))
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_wire(self.header_u32(12))
    }

    pub fn node_command(&self) -> Option<NodeCommand> {
        NodeCommand::from_wire(self.command())
    }

    pub fn object_command(&self) -> Option<ObjectCommand> {
        ObjectCommand::from_wire(self.command())
    }

    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_valid(&self) -> bool {
        self.buffer.is_valid() && self.buffer.len() >= FRAME_HEADER_SIZE
    }

    /// The sending node, when known; handshake packets arrive before one
    /// exists.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.clone()
    }

    pub fn local_node(&self) -> Option<Arc<LocalNode>> {
        self.local.upgrade()
    }

    /// The connection this command arrived on.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.clone()
    }

    /// Read one value off the embedded stream.
    pub fn get<T: Scalar>(&mut self) -> Result<T, StreamError> {
        self.stream.read::<T>()
    }

    pub fn stream_mut(&mut self) -> &mut InputStream<PayloadSource> {
        &mut self.stream
    }

    /// Zero-copy view of everything the cursor has not consumed yet.
    pub fn remaining_region(&mut self) -> Option<Region> {
        let remaining = self.stream.remaining_buffer_size();
        self.stream.get_remaining_buffer(remaining)
    }

    /// Change the command code for subsequent dispatching.
    pub fn set_command(&mut self, command: NodeCommand) {
        self.override_command = Some(command.to_wire());
    }

    /// Store the function the command will be dispatched to.
    pub fn set_dispatch_fn(&mut self, f: CommandFn) {
        self.dispatch = Some(f);
    }

    /// Invoke and clear the stored dispatch function.
    pub fn invoke(&mut self) -> bool {
        match self.dispatch.take() {
            Some(f) => f(self),
            None => {
                debug_assert!(false, "command invoked without dispatch function");
                true
            }
        }
    }
}

impl Clone for Command {
    /// An independent cursor over the same buffer; the dispatch function
    /// is not inherited.
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            node: self.node.clone(),
            local: self.local.clone(),
            connection: self.connection.clone(),
            stream: Self::payload_stream(&self.buffer),
            dispatch: None,
            override_command: self.override_command,
            _outstanding: self._outstanding.clone(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command(cmd {} type {:?} size {}",
            self.command(),
            self.packet_type(),
            self.size()
        )?;
        match &self.node {
            Some(node) => write!(f, " from {})", node.id()),
            None => write!(f, " from ?)"),
        }
    }
}

/// Allocates commands backed by pooled buffers and tracks how many are
/// outstanding.
#[derive(Clone)]
pub struct CommandCache {
    buffers: BufferCache,
    outstanding: Arc<AtomicUsize>,
}

impl CommandCache {
    pub fn new() -> Self {
        Self {
            buffers: BufferCache::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stage a zeroed frame buffer of `size` bytes for filling.
    pub fn alloc_frame(&self, size: usize) -> BufferMut {
        self.buffers.alloc(size)
    }

    /// Turn a filled frame buffer into a command.
    pub fn command(
        &self,
        buffer: Arc<Buffer>,
        node: Option<Arc<Node>>,
        local: Weak<LocalNode>,
        connection: Option<Arc<dyn Connection>>,
    ) -> Command {
        let stream = Command::payload_stream(&buffer);
        Command {
            buffer,
            node,
            local,
            connection,
            stream,
            dispatch: None,
            override_command: None,
            _outstanding: OutstandingGuard::new(&self.outstanding),
        }
    }

    /// Build a command from an already-framed byte vector, e.g. a locally
    /// synthesized packet.
    pub fn command_from_frame(
        &self,
        frame: Vec<u8>,
        node: Option<Arc<Node>>,
        local: Weak<LocalNode>,
    ) -> Command {
        self.command(self.buffers.adopt(frame), node, local, None)
    }

    /// Commands currently alive, clones included.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn buffers(&self) -> &BufferCache {
        &self.buffers
    }

    /// Drop pooled buffer storage.
    pub fn flush(&self) {
        self.buffers.flush();
    }
}

impl Default for CommandCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FrameWriter;

    fn ping_frame(extra: u32) -> Vec<u8> {
        let mut w = FrameWriter::node(NodeCommand::Ping);
        w.put_u32(extra);
        w.finish()
    }

    #[test]
    fn typed_reads_and_codes() {
        let cache = CommandCache::new();
        let mut cmd = cache.command_from_frame(ping_frame(0x1234), None, Weak::new());
        assert!(cmd.is_valid());
        assert_eq!(cmd.node_command(), Some(NodeCommand::Ping));
        assert_eq!(cmd.packet_type(), Some(PacketType::Node));
        assert_eq!(cmd.get::<u32>().unwrap(), 0x1234);
        assert!(matches!(
            cmd.get::<u32>(),
            Err(StreamError::Exhausted { .. })
        ));
    }

    #[test]
    fn clones_share_buffer_but_not_cursor() {
        let cache = CommandCache::new();
        let mut cmd = cache.command_from_frame(ping_frame(7), None, Weak::new());
        assert_eq!(cmd.get::<u32>().unwrap(), 7);
        let mut copy = cmd.clone();
        assert_eq!(copy.get::<u32>().unwrap(), 7);
        assert_eq!(cache.outstanding(), 2);
        drop(cmd);
        drop(copy);
        assert_eq!(cache.outstanding(), 0);
        assert_eq!(cache.buffers().outstanding(), 0);
    }

    #[test]
    fn override_changes_dispatch_code() {
        let cache = CommandCache::new();
        let mut cmd = cache.command_from_frame(ping_frame(1), None, Weak::new());
        cmd.set_command(NodeCommand::StopCmd);
        assert_eq!(cmd.node_command(), Some(NodeCommand::StopCmd));
        let copy = cmd.clone();
        assert_eq!(copy.node_command(), Some(NodeCommand::StopCmd));
    }

    #[test]
    fn dispatch_function_runs_once() {
        let cache = CommandCache::new();
        let mut cmd = cache.command_from_frame(ping_frame(1), None, Weak::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        cmd.set_dispatch_fn(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::AcqRel);
            true
        }));
        assert!(cmd.invoke());
        assert_eq!(hits.load(Ordering::Acquire), 1);
    }
}
