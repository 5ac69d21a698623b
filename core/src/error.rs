use thiserror::Error;

use fresco_stream::StreamError;

use crate::connection::TransportError;
use crate::types::ObjectId;

/// Failures of the public node API. Handshake refusals and timeouts come
/// back as typed variants; no partial state remains after any of them.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is in the wrong state for this operation")]
    BadState,

    #[error("can't set up listener on {descriptor}")]
    Listen {
        descriptor: String,
        #[source]
        source: TransportError,
    },

    #[error("connection handshake timed out")]
    ConnectTimeout,

    #[error("peer refused the connection")]
    Refused,

    #[error("node unreachable, all connection attempts failed")]
    Unreachable,

    #[error("request timed out")]
    Timeout,

    #[error("node is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Failures of object mapping and version sync.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object data packet out of sequence: expected {expected}, got {got}")]
    Sequence { expected: u32, got: u32 },

    #[error("object data packet changed version mid-stream")]
    VersionMismatch,

    #[error("object {0} is not attached")]
    NotAttached(ObjectId),

    #[error("object {0} is already attached")]
    AlreadyAttached(ObjectId),

    #[error("unexpected command in object data fifo")]
    BadCommand,

    #[error(transparent)]
    Stream(#[from] StreamError),
}
