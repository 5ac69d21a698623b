//! Readiness multiplexing across a dynamic set of heterogeneous
//! connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use parking_lot::Mutex;

use super::{Connection, ConnectionId};

/// Outcome of one [`ConnectionSet::select`] call.
pub enum SetEvent {
    /// A listener has a peer waiting to be accepted.
    Connect(Arc<dyn Connection>),
    /// A connection has data to read.
    Data(Arc<dyn Connection>),
    /// The peer went away.
    Disconnect(Arc<dyn Connection>),
    /// The connection's wait handle became unusable.
    InvalidHandle(Arc<dyn Connection>),
    Timeout,
    /// A connection-level error was reported.
    Error(Arc<dyn Connection>),
    /// The wait primitive itself failed.
    SelectError,
    /// [`ConnectionSet::interrupt`] was called.
    Interrupt,
}

/// Multiplexes readiness over the member connections' event channels.
///
/// The set may be mutated from any thread; membership changes apply before
/// the next wait begins, waking a blocked `select` silently. Buffered data
/// is served level-triggered with round-robin fairness so one busy
/// connection cannot starve the rest.
pub struct ConnectionSet {
    connections: Mutex<Vec<Arc<dyn Connection>>>,
    dirty: AtomicBool,
    rotation: AtomicUsize,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = unbounded();
        let (interrupt_tx, interrupt_rx) = unbounded();
        Self {
            connections: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            rotation: AtomicUsize::new(0),
            wake_tx,
            wake_rx,
            interrupt_tx,
            interrupt_rx,
        }
    }

    pub fn add_connection(&self, connection: Arc<dyn Connection>) {
        self.connections.lock().push(connection);
        self.set_dirty();
    }

    pub fn remove_connection(&self, connection: &Arc<dyn Connection>) -> bool {
        let id = connection.id();
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| c.id() != id);
        let removed = connections.len() != before;
        drop(connections);
        if removed {
            self.set_dirty();
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().iter().any(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.lock().clone()
    }

    /// Force reconstruction of the wait set before the next wait.
    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        let _ = self.wake_tx.send(());
    }

    /// Make a blocked `select` return [`SetEvent::Interrupt`].
    pub fn interrupt(&self) {
        let _ = self.interrupt_tx.send(());
    }

    /// Wait for the next event, up to `timeout` (forever when `None`).
    pub fn select(&self, timeout: Option<Duration>) -> SetEvent {
        loop {
            // apply pending membership changes and drain stale wakeups
            self.dirty.store(false, Ordering::Release);
            while self.wake_rx.try_recv().is_ok() {}
            let snapshot = self.connections();

            if let Ok(()) = self.interrupt_rx.try_recv() {
                return SetEvent::Interrupt;
            }

            // level-triggered pass over buffered data, rotated for fairness
            if !snapshot.is_empty() {
                let start = self.rotation.fetch_add(1, Ordering::Relaxed) % snapshot.len();
                for offset in 0..snapshot.len() {
                    let connection = &snapshot[(start + offset) % snapshot.len()];
                    if let Some(event) = Self::classify_ready(connection) {
                        return event;
                    }
                }
            }

            let mut select = Select::new();
            let wake_index = select.recv(&self.wake_rx);
            let interrupt_index = select.recv(&self.interrupt_rx);
            let base = 2;
            for connection in &snapshot {
                select.recv(connection.events());
            }
            debug_assert_eq!(wake_index, 0);
            debug_assert_eq!(interrupt_index, 1);

            let ready = match timeout {
                Some(t) => match select.ready_timeout(t) {
                    Ok(index) => index,
                    Err(_) => return SetEvent::Timeout,
                },
                None => select.ready(),
            };

            if ready == wake_index {
                continue; // membership changed, rebuild
            }
            if ready == interrupt_index {
                while self.interrupt_rx.try_recv().is_ok() {}
                return SetEvent::Interrupt;
            }

            let connection = &snapshot[ready - base];
            if let Some(event) = Self::classify_ready(connection) {
                return event;
            }
            // ready without messages: the channel is disconnected
            return SetEvent::Disconnect(Arc::clone(connection));
        }
    }

    fn classify_ready(connection: &Arc<dyn Connection>) -> Option<SetEvent> {
        if connection.is_listening() {
            if connection.events().is_empty() {
                return None;
            }
            return Some(SetEvent::Connect(Arc::clone(connection)));
        }
        if connection.has_buffered_data() {
            return Some(SetEvent::Data(Arc::clone(connection)));
        }
        None
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::super::PipeConnection;
    use super::*;

    #[test]
    fn select_reports_data() {
        let set = ConnectionSet::new();
        let (a, b) = PipeConnection::pair();
        set.add_connection(b.clone());

        a.send(&[1, 2, 3]).unwrap();
        match set.select(Some(Duration::from_millis(200))) {
            SetEvent::Data(c) => assert_eq!(c.id(), b.id()),
            _ => panic!("expected data event"),
        }
    }

    #[test]
    fn select_times_out() {
        let set = ConnectionSet::new();
        let (_a, b) = PipeConnection::pair();
        set.add_connection(b);
        assert!(matches!(
            set.select(Some(Duration::from_millis(20))),
            SetEvent::Timeout
        ));
    }

    #[test]
    fn interrupt_wakes_blocked_select() {
        let set = Arc::new(ConnectionSet::new());
        let waker = Arc::clone(&set);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            waker.interrupt();
        });
        assert!(matches!(set.select(None), SetEvent::Interrupt));
        handle.join().unwrap();
    }

    #[test]
    fn disconnect_is_detected() {
        let set = ConnectionSet::new();
        let (a, b) = PipeConnection::pair();
        set.add_connection(b.clone());
        a.close();
        match set.select(Some(Duration::from_millis(200))) {
            SetEvent::Disconnect(c) => assert_eq!(c.id(), b.id()),
            _ => panic!("expected disconnect event"),
        }
    }

    #[test]
    fn membership_change_wakes_select() {
        let set = Arc::new(ConnectionSet::new());
        let adder = Arc::clone(&set);
        let (a, b) = PipeConnection::pair();
        a.send(&[9]).unwrap();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            adder.add_connection(b);
        });
        // the add arrives while select is blocked; the new connection's
        // buffered byte must surface
        match set.select(Some(Duration::from_secs(2))) {
            SetEvent::Data(_) => {}
            _ => panic!("expected data after add"),
        }
        handle.join().unwrap();
    }
}
