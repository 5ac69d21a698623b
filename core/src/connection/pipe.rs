//! The in-process pipe transport: connection pairs over channels, plus a
//! per-transport endpoint table so pipe descriptions are connectable
//! within one process. Backs the local node's self-connection and the
//! test harnesses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::info;
use parking_lot::Mutex;

use super::{
    ConnEvent, Connection, ConnectionDescription, ConnectionId, ConnectionState, Transport,
    TransportError, TransportKind,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct ReadBuffer {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
}

impl ReadBuffer {
    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Copy buffered bytes into `out[filled..]`, returning the new fill.
    fn drain_into(&mut self, out: &mut [u8], mut filled: usize) -> usize {
        while filled < out.len() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let avail = front.len() - self.offset;
            let take = avail.min(out.len() - filled);
            out[filled..filled + take]
                .copy_from_slice(&front[self.offset..self.offset + take]);
            self.offset += take;
            filled += take;
            if self.offset == front.len() {
                self.chunks.pop_front();
                self.offset = 0;
            }
        }
        filled
    }
}

/// One end of an in-process duplex pipe.
pub struct PipeConnection {
    id: ConnectionId,
    description: ConnectionDescription,
    state: Mutex<ConnectionState>,
    peer_tx: Mutex<Option<Sender<ConnEvent>>>,
    events: Receiver<ConnEvent>,
    read_buffer: Mutex<ReadBuffer>,
}

impl PipeConnection {
    /// A connected pair of pipe ends.
    pub fn pair() -> (Arc<PipeConnection>, Arc<PipeConnection>) {
        Self::pair_with(ConnectionDescription::new(TransportKind::Pipe, "local", 0))
    }

    fn pair_with(description: ConnectionDescription) -> (Arc<PipeConnection>, Arc<PipeConnection>) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let a = Arc::new(PipeConnection {
            id: next_id(),
            description: description.clone(),
            state: Mutex::new(ConnectionState::Connected),
            peer_tx: Mutex::new(Some(a_tx)),
            events: a_rx,
            read_buffer: Mutex::new(ReadBuffer::default()),
        });
        let b = Arc::new(PipeConnection {
            id: next_id(),
            description,
            state: Mutex::new(ConnectionState::Connected),
            peer_tx: Mutex::new(Some(b_tx)),
            events: b_rx,
            read_buffer: Mutex::new(ReadBuffer::default()),
        });
        (a, b)
    }
}

impl Connection for PipeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let guard = self.peer_tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(ConnEvent::Data(data.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut read_buffer = self.read_buffer.lock();
        let mut filled = read_buffer.drain_into(buf, 0);
        while filled < buf.len() {
            match self.events.recv() {
                Ok(ConnEvent::Data(chunk)) => {
                    read_buffer.chunks.push_back(chunk);
                    filled = read_buffer.drain_into(buf, filled);
                }
                Ok(ConnEvent::Incoming(_)) => continue,
                Ok(ConnEvent::Closed) | Err(_) => {
                    *self.state.lock() = ConnectionState::Closed;
                    return if filled == 0 {
                        Err(TransportError::Closed)
                    } else {
                        Err(TransportError::Incomplete {
                            wanted: buf.len(),
                            got: filled,
                        })
                    };
                }
            }
        }
        Ok(())
    }

    fn has_buffered_data(&self) -> bool {
        !self.read_buffer.lock().is_empty() || !self.events.is_empty()
    }

    fn events(&self) -> &Receiver<ConnEvent> {
        &self.events
    }

    fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        // dropping the sender disconnects the peer's event channel
        self.peer_tx.lock().take();
    }
}

type EndpointMap = Mutex<HashMap<String, Sender<ConnEvent>>>;

/// A listening pipe endpoint registered in the transport's table.
pub struct PipeListener {
    id: ConnectionId,
    description: ConnectionDescription,
    state: Mutex<ConnectionState>,
    events: Receiver<ConnEvent>,
    endpoints: Weak<EndpointMap>,
    key: String,
}

impl Connection for PipeListener {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    fn send(&self, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::NotListening)
    }

    fn recv_exact(&self, _buf: &mut [u8]) -> Result<(), TransportError> {
        Err(TransportError::NotListening)
    }

    fn has_buffered_data(&self) -> bool {
        false
    }

    fn events(&self) -> &Receiver<ConnEvent> {
        &self.events
    }

    fn accept(&self) -> Result<Arc<dyn Connection>, TransportError> {
        loop {
            match self.events.try_recv() {
                Ok(ConnEvent::Incoming(connection)) => return Ok(connection),
                Ok(_) => continue,
                Err(_) => return Err(TransportError::NonePending),
            }
        }
    }

    fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        if let Some(endpoints) = self.endpoints.upgrade() {
            endpoints.lock().remove(&self.key);
        }
    }
}

fn endpoint_key(description: &ConnectionDescription) -> String {
    format!("{}:{}", description.hostname, description.port)
}

/// In-process loopback transport keyed by `host:port`.
pub struct PipeTransport {
    endpoints: Arc<EndpointMap>,
}

impl PipeTransport {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for PipeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for PipeTransport {
    fn connect(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let key = endpoint_key(description);
        let listener_tx = self
            .endpoints
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::Refused(key.clone()))?;

        let (near, far) = PipeConnection::pair_with(description.clone());
        listener_tx
            .send(ConnEvent::Incoming(far))
            .map_err(|_| TransportError::Refused(key))?;
        Ok(near)
    }

    fn listen(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let key = endpoint_key(description);
        let mut endpoints = self.endpoints.lock();
        if endpoints.contains_key(&key) {
            return Err(TransportError::AddressInUse(key));
        }
        let (tx, rx) = unbounded();
        endpoints.insert(key.clone(), tx);
        info!("pipe listener on {key}");
        Ok(Arc::new(PipeListener {
            id: next_id(),
            description: description.clone(),
            state: Mutex::new(ConnectionState::Listening),
            events: rx,
            endpoints: Arc::downgrade(&self.endpoints),
            key,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_round_trip() {
        let (a, b) = PipeConnection::pair();
        a.send(&[1, 2, 3, 4, 5]).unwrap();
        a.send(&[6]).unwrap();

        let mut head = [0u8; 2];
        b.recv_exact(&mut head).unwrap();
        assert_eq!(head, [1, 2]);
        assert!(b.has_buffered_data());

        let mut tail = [0u8; 4];
        b.recv_exact(&mut tail).unwrap();
        assert_eq!(tail, [3, 4, 5, 6]);
        assert!(!b.has_buffered_data());
    }

    #[test]
    fn close_is_seen_by_peer() {
        let (a, b) = PipeConnection::pair();
        a.close();
        let mut buf = [0u8; 1];
        assert!(matches!(
            b.recv_exact(&mut buf),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn listener_accepts_connectors() {
        let transport = PipeTransport::new();
        let desc = ConnectionDescription::new(TransportKind::Pipe, "node", 7001);
        let listener = transport.listen(&desc).unwrap();
        assert!(listener.is_listening());
        assert!(matches!(
            transport.listen(&desc),
            Err(TransportError::AddressInUse(_))
        ));

        let near = transport.connect(&desc).unwrap();
        let far = listener.accept().unwrap();
        near.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        far.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        listener.close();
        assert!(matches!(
            transport.connect(&desc),
            Err(TransportError::Refused(_))
        ));
    }
}
