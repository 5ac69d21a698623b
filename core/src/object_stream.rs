//! Object data streams: the command-FIFO-backed input stream that
//! reassembles one object version, and the framing sink that produces the
//! matching packets.

use std::collections::VecDeque;
use std::sync::Arc;

use log::error;

use fresco_stream::{
    BucketOut, BucketPayload, BucketSink, BucketSource, Compressor, CompressorRegistry,
    InputStream, OutputStream, RawBucket, StreamError, COMPRESSOR_NONE,
};

use crate::command::Command;
use crate::connection::Connection;
use crate::error::ObjectError;
use crate::packet::{ObjectCommand, ObjectDataPayload};
use crate::types::{host_is_big_endian, ObjectId, Version};

/// Lifecycle of an [`ObjectDataIStream`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StreamState {
    Empty,
    /// Packets queued, final one not yet seen.
    Accumulating,
    /// The `last` packet arrived; the version is complete.
    Ready,
    /// A ready stream whose commands have all been consumed.
    Consumed,
}

/// The ordered command FIFO feeding an [`ObjectDataIStream`].
pub struct CommandFifo {
    commands: VecDeque<Command>,
    version: Version,
    last_sequence: Option<u32>,
    ready: bool,
    consumed: bool,
}

impl CommandFifo {
    fn new() -> Self {
        Self {
            commands: VecDeque::new(),
            version: Version::NONE,
            last_sequence: None,
            ready: false,
            consumed: false,
        }
    }
}

impl BucketSource for CommandFifo {
    fn next_bucket(&mut self) -> Result<Option<RawBucket>, StreamError> {
        let Some(mut command) = self.commands.pop_front() else {
            return Ok(None);
        };
        self.consumed = true;
        if command.object_command().is_none() {
            error!("illegal command in object data fifo: {command:?}");
            debug_assert!(false, "non-object command queued");
            return Ok(None);
        }
        let header = ObjectDataPayload::read(&mut command)?;
        let data = command
            .remaining_region()
            .ok_or(StreamError::Exhausted { wanted: 0 })?;
        let payload = if header.compressor == COMPRESSOR_NONE {
            BucketPayload::SizePrefixed(data)
        } else {
            BucketPayload::Compressed {
                id: header.compressor,
                n_chunks: header.n_chunks,
                data,
            }
        };
        Ok(Some(RawBucket {
            payload,
            uncompressed_size: header.data_size,
        }))
    }

    fn remaining_buckets(&self) -> usize {
        self.commands.len()
    }
}

/// Reassembles the OBJECT_DELTA / OBJECT_INSTANCE / OBJECT_SLAVE_DELTA
/// packets of one object version into a typed input stream.
///
/// Queued commands share a single version and carry contiguous sequence
/// numbers starting at 0; the stream becomes ready when the packet flagged
/// `last` arrives.
pub struct ObjectDataIStream {
    stream: InputStream<CommandFifo>,
}

impl ObjectDataIStream {
    pub fn new(registry: Arc<CompressorRegistry>) -> Self {
        Self {
            stream: InputStream::new(CommandFifo::new()).with_registry(registry),
        }
    }

    /// Queue one data packet. Sequence gaps and mid-stream version changes
    /// are protocol violations: the packet is refused and the stream left
    /// untouched.
    pub fn add_data_packet(&mut self, command: Command) -> Result<(), ObjectError> {
        let header = ObjectDataPayload::peek(&command)?;
        let fifo = self.stream.source_mut();

        match fifo.last_sequence {
            None => {
                if header.sequence != 0 {
                    debug_assert!(false, "first packet with sequence {}", header.sequence);
                    return Err(ObjectError::Sequence {
                        expected: 0,
                        got: header.sequence,
                    });
                }
            }
            Some(previous) => {
                if header.sequence != previous + 1 {
                    debug_assert!(
                        false,
                        "packet sequence {} after {previous}",
                        header.sequence
                    );
                    return Err(ObjectError::Sequence {
                        expected: previous + 1,
                        got: header.sequence,
                    });
                }
                if header.version != fifo.version {
                    debug_assert!(false, "version changed mid-stream");
                    return Err(ObjectError::VersionMismatch);
                }
            }
        }

        // arm byte swapping from the sender's advertised byte order
        let swap = command
            .node()
            .map(|node| node.is_big_endian() != host_is_big_endian())
            .unwrap_or(false);

        let fifo = self.stream.source_mut();
        fifo.version = header.version;
        fifo.last_sequence = Some(header.sequence);
        if header.last {
            fifo.ready = true;
        }
        fifo.commands.push_back(command);
        self.stream.set_swapping(swap);
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        let fifo = self.stream.source();
        match (fifo.ready, fifo.commands.is_empty(), fifo.consumed) {
            (false, true, false) => StreamState::Empty,
            (false, _, _) => StreamState::Accumulating,
            (true, true, true) => StreamState::Consumed,
            (true, _, _) => StreamState::Ready,
        }
    }

    /// True once the final packet of the version has arrived.
    pub fn is_ready(&self) -> bool {
        self.stream.source().ready
    }

    /// The version shared by the queued packets.
    pub fn version(&self) -> Version {
        self.stream.source().version
    }

    /// Version of the most recently enqueued packet; [`Version::NONE`]
    /// when nothing is queued.
    pub fn pending_version(&self) -> Version {
        let fifo = self.stream.source();
        if fifo.commands.is_empty() && !fifo.ready {
            Version::NONE
        } else {
            fifo.version
        }
    }

    /// Sum of the uncompressed payload sizes still queued.
    pub fn data_size(&self) -> u64 {
        self.stream
            .source()
            .commands
            .iter()
            .map(|command| {
                ObjectDataPayload::peek(command)
                    .map(|header| header.data_size)
                    .unwrap_or(0)
            })
            .sum()
    }

    pub fn remaining_commands(&self) -> usize {
        self.stream.source().commands.len()
    }

    /// The typed cursor over the reassembled bytes.
    pub fn stream_mut(&mut self) -> &mut InputStream<CommandFifo> {
        &mut self.stream
    }

    /// Release every queued command and return to EMPTY.
    pub fn reset(&mut self) {
        self.stream.reset();
        *self.stream.source_mut() = CommandFifo::new();
    }
}

/// Frames outgoing buckets as OBJECT data packets on one connection.
pub struct ObjectDataSink {
    connection: Arc<dyn Connection>,
    command: ObjectCommand,
    object_id: ObjectId,
    instance_id: u32,
    version: Version,
    sequence: u32,
}

impl ObjectDataSink {
    pub fn new(
        connection: Arc<dyn Connection>,
        command: ObjectCommand,
        object_id: ObjectId,
        instance_id: u32,
        version: Version,
    ) -> Self {
        Self {
            connection,
            command,
            object_id,
            instance_id,
            version,
            sequence: 0,
        }
    }
}

impl BucketSink for ObjectDataSink {
    fn send_bucket(&mut self, bucket: BucketOut<'_>) -> Result<(), StreamError> {
        let header = ObjectDataPayload {
            object_id: self.object_id,
            instance_id: self.instance_id,
            sequence: self.sequence,
            version: self.version,
            compressor: bucket.compressor,
            n_chunks: bucket.n_chunks,
            data_size: bucket.uncompressed_size,
            last: bucket.last,
        };
        self.sequence += 1;
        let frame = header.frame_with_payload(self.command, bucket.payload);
        self.connection
            .send(&frame)
            .map_err(|e| StreamError::Sink(e.to_string()))
    }
}

/// Bucketized output stream emitting one object version onto a connection.
pub type ObjectDataOStream = OutputStream<ObjectDataSink>;

/// Build the output stream for one version of one object.
pub fn object_data_ostream(
    connection: Arc<dyn Connection>,
    command: ObjectCommand,
    object_id: ObjectId,
    instance_id: u32,
    version: Version,
    compressor: Option<Arc<dyn Compressor>>,
) -> ObjectDataOStream {
    let sink = ObjectDataSink::new(connection, command, object_id, instance_id, version);
    match compressor {
        Some(codec) => OutputStream::new(sink).with_compressor(codec),
        None => OutputStream::new(sink),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::command::CommandCache;

    fn data_frame(sequence: u32, version: u128, last: bool, payload: &[u8]) -> Vec<u8> {
        let mut body = (payload.len() as u64).to_le_bytes().to_vec();
        body.extend_from_slice(payload);
        ObjectDataPayload {
            object_id: ObjectId::from_u128(0x42),
            instance_id: 0,
            sequence,
            version: Version(version),
            compressor: COMPRESSOR_NONE,
            n_chunks: 1,
            data_size: payload.len() as u64,
            last,
        }
        .frame_with_payload(ObjectCommand::Delta, &body)
    }

    fn command(cache: &CommandCache, frame: Vec<u8>) -> Command {
        cache.command_from_frame(frame, None, Weak::new())
    }

    #[test]
    fn accumulates_until_last() {
        let cache = CommandCache::new();
        let registry = Arc::new(CompressorRegistry::with_defaults());
        let mut stream = ObjectDataIStream::new(registry);
        assert_eq!(stream.state(), StreamState::Empty);
        assert_eq!(stream.pending_version(), Version::NONE);

        stream
            .add_data_packet(command(&cache, data_frame(0, 7, false, &[1, 2, 3])))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Accumulating);
        assert_eq!(stream.pending_version(), Version(7));
        assert!(!stream.is_ready());

        stream
            .add_data_packet(command(&cache, data_frame(1, 7, true, &[4, 5])))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Ready);
        assert_eq!(stream.data_size(), 5);

        let mut bytes = [0u8; 5];
        stream.stream_mut().read_bytes(&mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4, 5]);
        assert!(!stream.stream_mut().has_data());
        assert_eq!(stream.state(), StreamState::Consumed);
    }

    #[test]
    fn rejects_sequence_gap() {
        let cache = CommandCache::new();
        let registry = Arc::new(CompressorRegistry::with_defaults());
        let mut stream = ObjectDataIStream::new(registry);
        stream
            .add_data_packet(command(&cache, data_frame(0, 7, false, &[1])))
            .unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stream.add_data_packet(command(&cache, data_frame(2, 7, true, &[2])))
        }));
        // fatal in development (assert), typed error in production
        match result {
            Ok(inner) => assert!(matches!(
                inner,
                Err(ObjectError::Sequence {
                    expected: 1,
                    got: 2
                })
            )),
            Err(_) => assert!(cfg!(debug_assertions)),
        }
    }

    #[test]
    fn rejects_nonzero_first_sequence() {
        let cache = CommandCache::new();
        let registry = Arc::new(CompressorRegistry::with_defaults());
        let mut stream = ObjectDataIStream::new(registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stream.add_data_packet(command(&cache, data_frame(3, 7, true, &[1])))
        }));
        match result {
            Ok(inner) => assert!(matches!(inner, Err(ObjectError::Sequence { .. }))),
            Err(_) => assert!(cfg!(debug_assertions)),
        }
    }

    #[test]
    fn reset_releases_commands() {
        let cache = CommandCache::new();
        let registry = Arc::new(CompressorRegistry::with_defaults());
        let mut stream = ObjectDataIStream::new(registry);
        stream
            .add_data_packet(command(&cache, data_frame(0, 9, true, &[1, 2])))
            .unwrap();
        assert_eq!(cache.outstanding(), 1);
        stream.reset();
        assert_eq!(stream.state(), StreamState::Empty);
        assert_eq!(cache.outstanding(), 0);
    }
}
