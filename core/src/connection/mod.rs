//! The transport seam: concrete transports live outside the runtime and
//! plug in through [`Connection`] and [`Transport`].

mod description;
mod pipe;
mod set;

pub use description::{ConnectionDescription, TransportKind};
pub use pipe::{PipeConnection, PipeTransport};
pub use set::{ConnectionSet, SetEvent};

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use thiserror::Error;

pub type ConnectionId = u64;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Listening,
}

/// What a transport reports on a connection's readiness channel.
pub enum ConnEvent {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// A peer connected to this listener.
    Incoming(Arc<dyn Connection>),
    /// The peer closed its end.
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("transport kind {0:?} is not registered")]
    UnknownTransport(TransportKind),

    #[error("address {0} already in use")]
    AddressInUse(String),

    #[error("incomplete read: wanted {wanted}, got {got}")]
    Incomplete { wanted: usize, got: usize },

    #[error("connection is not a listener")]
    NotListening,

    #[error("no incoming connection pending")]
    NonePending,
}

/// One connection to a peer, usable from any thread.
///
/// Readiness is reported on the `events()` channel so a
/// [`ConnectionSet`] can multiplex heterogeneous transports without
/// polling; `recv_exact` blocks on the same channel.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    fn description(&self) -> &ConnectionDescription;

    /// Queue `data` for delivery to the peer, in order.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Block until exactly `buf.len()` bytes have been read.
    fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// True when a `recv_exact` would make progress without blocking.
    fn has_buffered_data(&self) -> bool;

    /// The readiness channel a [`ConnectionSet`] selects on.
    fn events(&self) -> &Receiver<ConnEvent>;

    /// Accept one pending peer on a listening connection.
    fn accept(&self) -> Result<Arc<dyn Connection>, TransportError> {
        Err(TransportError::NotListening)
    }

    fn close(&self);

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn is_listening(&self) -> bool {
        self.state() == ConnectionState::Listening
    }

    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }
}

/// Factory for one transport family.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, TransportError>;

    fn listen(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Maps transport kinds to their factories. Passed to each local node
/// explicitly; nodes sharing a registry (in one process) can reach each
/// other's pipe listeners.
pub struct TransportRegistry {
    transports: RwLock<HashMap<TransportKind, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the in-process pipe transport installed.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(TransportKind::Pipe, Arc::new(PipeTransport::new()));
        registry
    }

    pub fn register(&self, kind: TransportKind, transport: Arc<dyn Transport>) {
        self.transports.write().insert(kind, transport);
    }

    pub fn connect(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let transport = self
            .transports
            .read()
            .get(&description.kind)
            .cloned()
            .ok_or(TransportError::UnknownTransport(description.kind))?;
        transport.connect(description)
    }

    pub fn listen(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let transport = self
            .transports
            .read()
            .get(&description.kind)
            .cloned()
            .ok_or(TransportError::UnknownTransport(description.kind))?;
        transport.listen(description)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
