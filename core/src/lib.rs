//! # Fresco Core
//! The local-node networking core of the fresco distributed-object
//! runtime: connection multiplexing, the command lifecycle, the node
//! handshake, send-token arbitration and versioned object data streams.
//!
//! Peer processes connect over pluggable transports, publish versioned
//! objects and propagate state changes to interested slave replicas. Bytes
//! arrive at a [`ConnectionSet`]; the receiver thread frames them into
//! [`Command`]s which dispatch inline, onto the command thread's queue, or
//! into the [`ObjectStore`].

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod buffer;
mod command;
mod config;
mod connection;
mod dispatcher;
mod error;
mod local_node;
mod node;
mod object;
mod object_store;
mod object_stream;
mod packet;
mod queue;
mod request;
mod types;

pub use buffer::{Buffer, BufferCache, BufferMut};
pub use command::{Command, CommandCache, CommandFn, PayloadSource};
pub use config::{Globals, LocalNodeConfig, TIMEOUT_INDEFINITE};
pub use connection::{
    ConnEvent, Connection, ConnectionDescription, ConnectionId, ConnectionSet, ConnectionState,
    PipeConnection, PipeTransport, SetEvent, Transport, TransportError, TransportKind,
    TransportRegistry,
};
pub use dispatcher::Dispatcher;
pub use error::{NodeError, ObjectError};
pub use local_node::{LocalNode, PushHandler, SendToken};
pub use node::{MulticastState, Node, NodeInfo, NodeState};
pub use object::{
    deserialize_children, read_object_versions, write_object_versions, Object, ObjectOwner,
};
pub use object_store::ObjectStore;
pub use object_stream::{
    object_data_ostream, CommandFifo, ObjectDataIStream, ObjectDataOStream, ObjectDataSink,
    StreamState,
};
pub use packet::{
    empty_node_frame, AckRequestPayload, AddListenerPayload, ConnectPayload, ConnectReplyPayload,
    DisconnectPayload, FrameWriter, GetNodeDataPayload, GetNodeDataReplyPayload, NodeCommand,
    NodeIdPayload, ObjectCommand, ObjectDataPayload, PacketType, RemoveListenerPayload,
    RemoveNodePayload, SendTokenPayload, FRAME_HEADER_SIZE, UNDEFINED_REQUEST,
};
pub use queue::CommandQueue;
pub use request::{RequestError, RequestHandler, RequestId, RequestValue};
pub use types::{
    host_is_big_endian, NodeId, NodeKind, ObjectId, ObjectVersion, Version,
};
