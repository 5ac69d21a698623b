//! The this-process endpoint of the distributed runtime.
//!
//! One receiver thread owns connection I/O and the connection → node map;
//! one command thread drains a FIFO of retained commands. Application
//! threads drive the public API and block on request handles until a
//! handler posts the result.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use fresco_stream::CompressorRegistry;

use crate::command::{Command, CommandCache, CommandFn};
use crate::config::{Globals, LocalNodeConfig, TIMEOUT_INDEFINITE};
use crate::connection::{
    Connection, ConnectionDescription, ConnectionId, ConnectionSet, PipeConnection, SetEvent,
    TransportRegistry,
};
use crate::dispatcher::Dispatcher;
use crate::error::{NodeError, ObjectError};
use crate::node::{Node, NodeInfo, NodeState};
use crate::object::Object;
use crate::object_store::ObjectStore;
use crate::object_stream::ObjectDataIStream;
use crate::packet::{
    empty_node_frame, AckRequestPayload, AddListenerPayload, ConnectPayload,
    ConnectReplyPayload, DisconnectPayload, GetNodeDataPayload, GetNodeDataReplyPayload,
    NodeCommand, NodeIdPayload, PacketType, RemoveListenerPayload, RemoveNodePayload,
    SendTokenPayload, FRAME_HEADER_SIZE, UNDEFINED_REQUEST,
};
use crate::queue::CommandQueue;
use crate::request::{RequestHandler, RequestId, RequestValue};
use crate::types::{NodeId, NodeKind, ObjectId, Version};

/// Deferred-dispatch back-pressure watermark.
const PENDING_WATERMARK: usize = 200;

/// Handshake reply wait.
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked for pushed object data, keyed by group id.
pub type PushHandler = Arc<dyn Fn(u128, u128, ObjectId, &mut ObjectDataIStream) + Send + Sync>;

/// Permit to send a large payload to its node without contention; hand it
/// back with [`LocalNode::release_send_token`].
pub struct SendToken {
    node: Arc<Node>,
}

impl SendToken {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

struct SendTokenState {
    available: bool,
    last_grant: i64,
    queue: VecDeque<Command>,
}

enum ConnectOutcome {
    Ok,
    TryAgain,
    BadState,
    Timeout,
    Unreachable,
}

type DisconnectHandler = Box<dyn Fn(Arc<Node>) + Send + Sync>;

/// The local node: connection set, node maps, command lifecycle, object
/// store and the receiver / command thread pair.
pub struct LocalNode {
    node: Arc<Node>,
    globals: Globals,
    transports: Arc<TransportRegistry>,
    compressors: Arc<CompressorRegistry>,

    incoming: ConnectionSet,
    /// Written only by the receiver thread.
    connection_nodes: Mutex<HashMap<ConnectionId, Arc<Node>>>,
    /// Read by many threads, written by the receiver thread.
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,

    command_cache: CommandCache,
    dispatcher: Dispatcher,
    command_queue: CommandQueue,
    requests: RequestHandler,
    object_store: ObjectStore,

    /// Commands re-scheduled for dispatch; receiver thread only.
    pending_commands: Mutex<Vec<Command>>,

    send_token: Mutex<SendTokenState>,
    /// Serializes nodeID-based connects across application threads.
    connect_lock: Mutex<()>,

    push_handlers: Mutex<HashMap<u128, PushHandler>>,
    pending_listeners: Mutex<HashMap<u32, Arc<dyn Connection>>>,
    listener_tokens: AtomicU32,
    on_disconnect: Mutex<Option<DisconnectHandler>>,

    epoch: Instant,
    receiver_thread: Mutex<Option<thread::JoinHandle<()>>>,
    command_thread: Mutex<Option<thread::JoinHandle<()>>>,
    receiver_tid: Mutex<Option<thread::ThreadId>>,
    command_tid: Mutex<Option<thread::ThreadId>>,
}

impl LocalNode {
    pub fn new(config: LocalNodeConfig) -> Arc<LocalNode> {
        let LocalNodeConfig {
            id,
            globals,
            listen,
            transports,
            compressors,
        } = config;
        let node = Node::with_descriptions(id, NodeKind::Node, listen);
        let local = Arc::new(LocalNode {
            node,
            globals,
            transports,
            compressors: Arc::clone(&compressors),
            incoming: ConnectionSet::new(),
            connection_nodes: Mutex::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            command_cache: CommandCache::new(),
            dispatcher: Dispatcher::new(),
            command_queue: CommandQueue::new(),
            requests: RequestHandler::new(),
            object_store: ObjectStore::new(compressors),
            pending_commands: Mutex::new(Vec::new()),
            send_token: Mutex::new(SendTokenState {
                available: true,
                last_grant: 0,
                queue: VecDeque::new(),
            }),
            connect_lock: Mutex::new(()),
            push_handlers: Mutex::new(HashMap::new()),
            pending_listeners: Mutex::new(HashMap::new()),
            listener_tokens: AtomicU32::new(1),
            on_disconnect: Mutex::new(None),
            epoch: Instant::now(),
            receiver_thread: Mutex::new(None),
            command_thread: Mutex::new(None),
            receiver_tid: Mutex::new(None),
            command_tid: Mutex::new(None),
        });
        local.register_command_handlers();
        local
    }

    /// Consume `--eq-listen` / `--co-globals` from `args`, then listen.
    pub fn init_local<I>(args: I) -> Result<Arc<LocalNode>, NodeError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = LocalNodeConfig::default();
        config.apply_args(args)?;
        let local = Self::new(config);
        local.listen()?;
        Ok(local)
    }

    fn handler(self: &Arc<Self>, f: fn(&Arc<LocalNode>, &mut Command) -> bool) -> CommandFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |command: &mut Command| match weak.upgrade() {
            Some(local) => f(&local, command),
            None => true,
        })
    }

    fn register_command_handlers(self: &Arc<Self>) {
        type Handler = fn(&Arc<LocalNode>, &mut Command) -> bool;
        let queue = self.command_queue.clone();
        let table: [(NodeCommand, Handler, bool); 18] = [
            (NodeCommand::AckRequest, Self::cmd_ack_request, false),
            (NodeCommand::StopRcv, Self::cmd_stop_rcv, false),
            (NodeCommand::StopCmd, Self::cmd_stop_cmd, true),
            (NodeCommand::Connect, Self::cmd_connect, false),
            (NodeCommand::ConnectReply, Self::cmd_connect_reply, false),
            (NodeCommand::ConnectAck, Self::cmd_connect_ack, false),
            (NodeCommand::Id, Self::cmd_id, false),
            (NodeCommand::Disconnect, Self::cmd_disconnect, false),
            (NodeCommand::GetNodeData, Self::cmd_get_node_data, true),
            (
                NodeCommand::GetNodeDataReply,
                Self::cmd_get_node_data_reply,
                false,
            ),
            (
                NodeCommand::AcquireSendToken,
                Self::cmd_acquire_send_token,
                true,
            ),
            (
                NodeCommand::AcquireSendTokenReply,
                Self::cmd_acquire_send_token_reply,
                false,
            ),
            (
                NodeCommand::ReleaseSendToken,
                Self::cmd_release_send_token,
                true,
            ),
            (NodeCommand::AddListener, Self::cmd_add_listener, false),
            (NodeCommand::RemoveListener, Self::cmd_remove_listener, false),
            (NodeCommand::Ping, Self::cmd_ping, true),
            (NodeCommand::PingReply, Self::cmd_discard, false),
            (NodeCommand::RemoveNode, Self::cmd_remove_node, true),
        ];
        for (command, f, queued) in table {
            let queue = queued.then(|| queue.clone());
            self.dispatcher.register(command.to_wire(), self.handler(f), queue);
        }
    }

    // ------------------------------------------------------------------
    // identity & small accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// The node record representing this process.
    pub fn self_node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn compressors(&self) -> &Arc<CompressorRegistry> {
        &self.compressors
    }

    pub fn command_cache(&self) -> &CommandCache {
        &self.command_cache
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.object_store
    }

    pub fn is_listening(&self) -> bool {
        self.node.state() == NodeState::Listening
    }

    pub fn is_closed(&self) -> bool {
        self.node.state() == NodeState::Closed
    }

    /// Milliseconds since this node was created.
    pub fn time_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn request_timeout(&self) -> Option<Duration> {
        match self.globals.timeout_ms {
            TIMEOUT_INDEFINITE => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn in_receiver_thread(&self) -> bool {
        *self.receiver_tid.lock() == Some(thread::current().id())
    }

    fn in_command_thread(&self) -> bool {
        *self.command_tid.lock() == Some(thread::current().id())
    }

    pub fn get_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(&id).cloned()
    }

    /// Every node in the id map, this node included.
    pub fn connected_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .values()
            .filter(|node| node.is_connected())
            .cloned()
            .collect()
    }

    /// Connected remote peers.
    pub fn peers(&self) -> Vec<Arc<Node>> {
        let own = self.id();
        self.connected_nodes()
            .into_iter()
            .filter(|node| node.id() != own)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.incoming.len()
    }

    /// Node-map integrity: every mapped node is connected and every
    /// tracked connection is a member of the connection set.
    pub fn verify_node_maps(&self) -> bool {
        if !self.nodes.read().values().all(|node| node.is_connected()) {
            return false;
        }
        self.connection_nodes
            .lock()
            .keys()
            .all(|id| self.incoming.contains(*id))
    }

    /// Run `handler` whenever a peer disconnects.
    pub fn set_disconnect_handler(&self, handler: impl Fn(Arc<Node>) + Send + Sync + 'static) {
        *self.on_disconnect.lock() = Some(Box::new(handler));
    }

    fn notify_disconnect(&self, node: &Arc<Node>) {
        if let Some(handler) = &*self.on_disconnect.lock() {
            handler(Arc::clone(node));
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Set up the self connection and all listeners, then start the
    /// receiver and command threads.
    pub fn listen(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.node.state() != NodeState::Closed {
            return Err(NodeError::BadState);
        }
        trace!("listener data: {}", self.node.info().serialize());
        self.connect_self();

        for description in self.node.descriptions() {
            let connection =
                self.transports
                    .listen(&description)
                    .map_err(|source| NodeError::Listen {
                        descriptor: description.to_string(),
                        source,
                    })?;
            self.connection_nodes
                .lock()
                .insert(connection.id(), Arc::clone(&self.node));
            if description.kind.is_multicast() {
                self.node
                    .with_multicast(|mc| mc.groups.push(Arc::clone(&connection)));
            }
            self.incoming.add_connection(connection);
            trace!("added listener {description} for {}", self.id());
        }

        self.node.set_state(NodeState::Listening);
        self.start_threads();
        info!("{} listening", self.id());
        Ok(())
    }

    /// Stop both threads and tear down every connection. All pending
    /// commands are released without invocation.
    pub fn close(self: &Arc<Self>) -> bool {
        if self.node.state() != NodeState::Listening {
            return false;
        }
        if self.send_to_self(empty_node_frame(NodeCommand::StopRcv)).is_err() {
            return false;
        }
        if let Some(handle) = self.receiver_thread.lock().take() {
            let _ = handle.join();
        }
        self.cleanup();
        debug_assert!(!self.requests.has_pending(), "pending requests at close");
        true
    }

    fn connect_self(self: &Arc<Self>) {
        // local pipe from the public API side to the receiver thread
        let (near, far) = PipeConnection::pair();
        self.node.set_outgoing(near);
        self.connection_nodes
            .lock()
            .insert(far.id(), Arc::clone(&self.node));
        self.nodes.write().insert(self.id(), Arc::clone(&self.node));
        self.incoming.add_connection(far);
        trace!("added self node {}", self.id());
    }

    fn start_threads(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("C {}", self.id()))
            .spawn(move || worker.run_command_thread())
            .expect("spawn command thread");
        *self.command_thread.lock() = Some(handle);

        let receiver = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("R {}", self.id()))
            .spawn(move || receiver.run_receiver())
            .expect("spawn receiver thread");
        *self.receiver_thread.lock() = Some(handle);
    }

    fn cleanup(&self) {
        debug_assert_eq!(self.node.state(), NodeState::Closed);
        self.node.with_multicast(|mc| {
            mc.elected = None;
            mc.groups.clear();
        });
        if let Some(outgoing) = self.node.take_outgoing() {
            outgoing.close();
        }

        for connection in self.incoming.connections() {
            let node = self.connection_nodes.lock().remove(&connection.id());
            if let Some(node) = node {
                node.set_state(NodeState::Closed);
                node.take_outgoing();
                node.with_multicast(|mc| {
                    mc.elected = None;
                    mc.groups.clear();
                });
                self.nodes.write().remove(&node.id());
            }
            self.incoming.remove_connection(&connection);
            connection.close();
        }

        let leftover = self.connection_nodes.lock().len();
        if leftover > 0 {
            info!("{leftover} open connections during cleanup");
        }
        self.connection_nodes.lock().clear();
        self.nodes.write().clear();
    }

    fn send_to_self(&self, frame: Vec<u8>) -> Result<(), NodeError> {
        self.node.send(&frame)
    }

    /// Wake a blocked receiver select to drain re-scheduled commands.
    pub fn flush_commands(&self) {
        self.incoming.interrupt();
    }

    // ------------------------------------------------------------------
    // receiver thread
    // ------------------------------------------------------------------

    fn run_receiver(self: &Arc<Self>) {
        *self.receiver_tid.lock() = Some(thread::current().id());

        let mut consecutive_errors = 0u32;
        while self.node.state() == NodeState::Listening {
            let event = self.incoming.select(None);
            let is_error = matches!(event, SetEvent::Error(_) | SetEvent::SelectError);
            match event {
                SetEvent::Connect(connection) => self.handle_connect(connection),
                SetEvent::Data(connection) => {
                    self.handle_data(&connection);
                }
                SetEvent::Disconnect(connection) | SetEvent::InvalidHandle(connection) => {
                    self.handle_disconnect(connection);
                }
                SetEvent::Timeout => trace!("select timeout"),
                SetEvent::Error(connection) => {
                    consecutive_errors += 1;
                    warn!("connection error during select");
                    if consecutive_errors > 100 {
                        warn!("too many errors in a row, capping connection");
                        self.handle_disconnect(connection);
                    }
                }
                SetEvent::SelectError => {
                    consecutive_errors += 1;
                    warn!("error during select");
                    if consecutive_errors > 10 {
                        error!("too many select errors in a row, leaving receiver loop");
                        break;
                    }
                }
                SetEvent::Interrupt => self.redispatch_commands(),
            }
            if !is_error {
                consecutive_errors = 0;
            }
        }

        let pending = std::mem::take(&mut *self.pending_commands.lock());
        if !pending.is_empty() {
            warn!(
                "{} commands pending while leaving receiver thread",
                pending.len()
            );
        }
        drop(pending);

        // aborted loop: release the command thread without the handshake
        if self.node.state() == NodeState::Listening {
            self.node.set_state(NodeState::Closed);
        }

        if let Some(handle) = self.command_thread.lock().take() {
            let _ = handle.join();
        }
        self.object_store.clear();
        self.command_queue.flush();
        self.command_cache.flush();
        info!("leaving receiver thread of {}", self.id());
    }

    fn handle_connect(&self, connection: Arc<dyn Connection>) {
        match connection.accept() {
            Ok(accepted) => self.incoming.add_connection(accepted),
            Err(e) => info!("received connect event, but accept failed: {e}"),
        }
    }

    fn handle_data(self: &Arc<Self>, connection: &Arc<dyn Connection>) -> bool {
        let node = self.connection_nodes.lock().get(&connection.id()).cloned();
        trace!("handle data from {node:?}");

        let mut size_bytes = [0u8; 8];
        if connection.recv_exact(&mut size_bytes).is_err() {
            // some transports signal data on dead connections
            return false;
        }
        let size = u64::from_le_bytes(size_bytes);
        if size < FRAME_HEADER_SIZE as u64 {
            warn!("erroneous network event on {}", connection.description());
            self.incoming.set_dirty();
            return false;
        }

        if let Some(node) = &node {
            node.set_last_receive(self.time_ms());
        }

        let mut frame = self.command_cache.alloc_frame(size as usize);
        frame.bytes_mut()[..8].copy_from_slice(&size_bytes);
        if let Err(e) = connection.recv_exact(&mut frame.bytes_mut()[8..]) {
            error!("incomplete packet read: {e}");
            return false;
        }

        let command = self.command_cache.command(
            frame.freeze(),
            node.clone(),
            Arc::downgrade(self),
            Some(Arc::clone(connection)),
        );
        debug_assert!(command.is_valid());
        // handshake packets legitimately arrive before the peer is known
        debug_assert!(
            node.is_some()
                || matches!(
                    command.node_command(),
                    Some(NodeCommand::Connect | NodeCommand::ConnectReply | NodeCommand::Id)
                ),
            "unknown sender for {command:?}"
        );

        self.dispatch_command_retained(command);
        true
    }

    fn handle_disconnect(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        // read remaining data off the connection first
        while self.handle_data(&connection) {}

        let node = self.connection_nodes.lock().get(&connection.id()).cloned();
        if let Some(node) = node {
            if node.id() == self.id() {
                self.connection_nodes.lock().remove(&connection.id());
            } else {
                let frame = RemoveNodePayload { node_id: node.id() }.frame();
                let command = self.command_cache.command_from_frame(
                    frame,
                    Some(Arc::clone(&node)),
                    Arc::downgrade(self),
                );
                self.dispatch_command_retained(command);

                let unicast_lost = node
                    .outgoing()
                    .map(|c| c.id() == connection.id())
                    .unwrap_or(false);
                if unicast_lost {
                    self.object_store.remove_node(node.id());
                    node.set_state(NodeState::Closed);
                    node.take_outgoing();
                    let elected = node.with_multicast(|mc| {
                        let elected = mc.elected.take();
                        mc.groups.clear();
                        elected
                    });
                    if let Some(elected) = elected {
                        self.remove_connection_inner(&elected);
                    }
                    {
                        let mut nodes = self.nodes.write();
                        self.connection_nodes.lock().remove(&connection.id());
                        nodes.remove(&node.id());
                    }
                    info!("{node:?} disconnected from {}", self.id());
                } else {
                    // a multicast connection died: promote the first
                    // auxiliary group, or demote the peer to unicast
                    node.with_multicast(|mc| {
                        let was_elected =
                            mc.elected.as_ref().map(|c| c.id()) == Some(connection.id());
                        if was_elected {
                            mc.elected = if mc.groups.is_empty() {
                                None
                            } else {
                                Some(mc.groups.remove(0))
                            };
                        } else {
                            mc.groups.retain(|c| c.id() != connection.id());
                        }
                    });
                    self.connection_nodes.lock().remove(&connection.id());
                }
                self.notify_disconnect(&node);
            }
        }

        self.remove_connection_inner(&connection);
    }

    fn remove_connection_inner(&self, connection: &Arc<dyn Connection>) {
        self.incoming.remove_connection(connection);
        if !connection.is_closed() {
            connection.close();
        }
    }

    // ------------------------------------------------------------------
    // command lifecycle
    // ------------------------------------------------------------------

    fn dispatch_command_retained(&self, mut command: Command) {
        debug_assert!(command.is_valid());
        if self.route_command(&mut command) {
            drop(command);
            self.redispatch_commands();
        } else {
            self.redispatch_commands();
            self.pending_commands.lock().push(command);
        }
    }

    /// Route by packet type: NODE packets through the dispatcher table,
    /// OBJECT packets to the object store. Returns false to defer.
    fn route_command(&self, command: &mut Command) -> bool {
        trace!("dispatch {command:?} by {}", self.id());
        debug_assert!(command.is_valid());
        match command.packet_type() {
            Some(PacketType::Node) => {
                let handled = self.dispatcher.dispatch(command);
                debug_assert!(handled, "node command refused dispatch");
                true
            }
            Some(PacketType::Object) => self.object_store.dispatch_object_command(command),
            None => {
                error!("unknown packet type for {command:?}");
                debug_assert!(false, "unknown packet type");
                true
            }
        }
    }

    /// Walk the pending list until a full pass makes no progress.
    fn redispatch_commands(&self) {
        loop {
            let mut list = std::mem::take(&mut *self.pending_commands.lock());
            if list.is_empty() {
                return;
            }
            let before = list.len();
            list.retain_mut(|command| !self.route_command(command));
            let after = list.len();

            let mut pending = self.pending_commands.lock();
            list.append(&mut *pending);
            *pending = list;
            let stalled = after == before;
            if stalled {
                if !pending.is_empty() {
                    trace!("{} undispatched commands", pending.len());
                }
                debug_assert!(pending.len() < PENDING_WATERMARK, "pending list overflow");
                return;
            }
        }
    }

    pub fn pending_command_count(&self) -> usize {
        self.pending_commands.lock().len()
    }

    // ------------------------------------------------------------------
    // command thread
    // ------------------------------------------------------------------

    fn run_command_thread(self: &Arc<Self>) {
        *self.command_tid.lock() = Some(thread::current().id());
        while self.node.state() != NodeState::Closed {
            match self.command_queue.pop(Duration::from_millis(100)) {
                Some(mut command) => {
                    if !command.invoke() {
                        debug_assert!(false, "command-thread handler deferred");
                    }
                }
                None => {
                    let _ = self.object_store.notify_idle();
                }
            }
        }
        // release without invocation
        self.command_queue.flush();
    }

    // ------------------------------------------------------------------
    // connecting nodes
    // ------------------------------------------------------------------

    /// Resolve and connect a node by identifier, querying every connected
    /// peer for its connection descriptions.
    pub fn connect(self: &Arc<Self>, node_id: NodeId) -> Option<Arc<Node>> {
        debug_assert!(!node_id.is_zero());
        if node_id.is_zero() || self.node.state() != NodeState::Listening {
            return None;
        }

        // one identifier-based connect at a time, so a node cannot be
        // instantiated twice by concurrent lookups
        let _guard = self.connect_lock.lock();

        if let Some(peer) = self.get_node(node_id) {
            if peer.is_connected() {
                return Some(peer);
            }
        }

        info!("connecting node {node_id}");
        for peer in self.peers() {
            if let Some(node) = self.connect_via(node_id, &peer) {
                return Some(node);
            }
        }

        // the peer may have connected to us in the meantime
        let found = self.get_node(node_id).filter(|node| node.is_connected());
        if found.is_none() {
            warn!("node {node_id} connection failed");
        }
        found
    }

    fn connect_via(self: &Arc<Self>, node_id: NodeId, peer: &Arc<Node>) -> Option<Arc<Node>> {
        if let Some(existing) = self.get_node(node_id) {
            if existing.is_connected() {
                return Some(existing);
            }
        }
        debug_assert!(self.id() != node_id);

        let request = self.requests.register();
        let frame = GetNodeDataPayload {
            request_id: request,
            node_id,
        }
        .frame();
        if peer.send(&frame).is_err() {
            return None;
        }

        let node = match self.requests.wait(request, self.request_timeout()) {
            Ok(RequestValue::Node(Some(node))) => node,
            Ok(_) => {
                info!("node {node_id} not found on {}", peer.id());
                return None;
            }
            Err(_) => return None,
        };
        self.connect_node(node)
    }

    /// Connect an already-resolved node, retrying on handshake collisions
    /// with randomized back-off. Returns the canonical connected node,
    /// which may be a different instance when the peer's simultaneous
    /// connect won.
    pub fn connect_node(self: &Arc<Self>, node: Arc<Node>) -> Option<Arc<Node>> {
        let mut node = node;
        if node.is_connected() {
            return Some(node);
        }

        let mut tries = 10;
        while tries > 0 {
            tries -= 1;
            match self.connect_attempt(&node) {
                ConnectOutcome::Ok => return Some(node),
                ConnectOutcome::TryAgain => {
                    // collision avoidance for simultaneous connects
                    let backoff = rand::thread_rng().gen_range(0..=255u64);
                    thread::sleep(Duration::from_millis(backoff));
                }
                ConnectOutcome::BadState => {
                    warn!("internal connect error");
                    return None;
                }
                ConnectOutcome::Timeout => return None,
                ConnectOutcome::Unreachable => {} // maybe the peer talks to us
            }

            // a simultaneous connect from the peer may have won
            if let Some(existing) = self.get_node(node.id()) {
                node = existing;
            }
            if node.is_connected() {
                return Some(node);
            }
        }

        node.is_connected().then_some(node)
    }

    fn connect_attempt(self: &Arc<Self>, node: &Arc<Node>) -> ConnectOutcome {
        if self.node.state() != NodeState::Listening {
            return ConnectOutcome::BadState;
        }
        match node.state() {
            NodeState::Connected | NodeState::Listening => return ConnectOutcome::Ok,
            NodeState::Closed => {}
            _ => return ConnectOutcome::BadState,
        }

        info!("connecting {node:?}");
        for description in node.descriptions() {
            if description.kind.is_multicast() {
                continue; // never a primary connection
            }
            let Ok(connection) = self.transports.connect(&description) else {
                continue;
            };
            return self.connect_with(node, connection);
        }

        warn!("node unreachable, all connections failed to connect");
        ConnectOutcome::Unreachable
    }

    fn connect_with(
        self: &Arc<Self>,
        node: &Arc<Node>,
        connection: Arc<dyn Connection>,
    ) -> ConnectOutcome {
        debug_assert!(node.id() != self.id());
        if self.node.state() != NodeState::Listening
            || !connection.is_connected()
            || node.state() != NodeState::Closed
        {
            return ConnectOutcome::BadState;
        }

        node.set_state(NodeState::Connecting);
        self.incoming.add_connection(Arc::clone(&connection));

        let request = self.requests.register_with_data(Arc::clone(node));
        let frame = ConnectPayload {
            request_id: request,
            node_id: self.id(),
            kind: self.node.kind(),
            info: self.node.info().serialize(),
        }
        .frame(NodeCommand::Connect);
        if connection.send(&frame).is_err() {
            node.set_state(NodeState::Closed);
            self.remove_connection_inner(&connection);
            return ConnectOutcome::BadState;
        }

        match self.requests.wait(request, Some(CONNECT_REPLY_TIMEOUT)) {
            Ok(RequestValue::Bool(true)) => {
                debug_assert!(!node.id().is_zero());
                info!("{node:?} connected to {}", self.id());
                ConnectOutcome::Ok
            }
            Ok(_) => {
                if node.state() == NodeState::Connecting {
                    node.set_state(NodeState::Closed);
                }
                ConnectOutcome::TryAgain
            }
            Err(_) => {
                warn!("node connection handshake timeout - {node:?} not a fresco node?");
                if node.state() == NodeState::Connecting {
                    node.set_state(NodeState::Closed);
                }
                self.remove_connection_inner(&connection);
                ConnectOutcome::Timeout
            }
        }
    }

    /// Disconnect a peer, serving the request from the receiver thread.
    pub fn disconnect(self: &Arc<Self>, node: &Arc<Node>) -> bool {
        if self.node.state() != NodeState::Listening {
            return false;
        }
        if !node.is_connected() {
            return true;
        }
        debug_assert!(!self.in_command_thread());

        let request = self.requests.register_with_data(Arc::clone(node));
        let frame = DisconnectPayload {
            request_id: request,
        }
        .frame();
        if self.send_to_self(frame).is_err() {
            return false;
        }
        self.requests.wait(request, self.request_timeout()).is_ok()
    }

    /// Acknowledge a request on `node`, short-circuiting when it is us.
    pub fn ack_request(&self, node: &Arc<Node>, request_id: RequestId) {
        if request_id == UNDEFINED_REQUEST {
            return;
        }
        if node.id() == self.id() {
            self.requests.serve(request_id, RequestValue::Unit);
        } else {
            let _ = node.send(&AckRequestPayload { request_id }.frame());
        }
    }

    pub fn ping(&self, node: &Arc<Node>) {
        debug_assert!(!self.in_receiver_thread());
        let _ = node.send(&empty_node_frame(NodeCommand::Ping));
    }

    /// Ping peers not heard from within the keepalive timeout.
    pub fn ping_idle_nodes(&self) -> bool {
        debug_assert!(!self.in_receiver_thread());
        let timeout = self.globals.keepalive_ms as i64;
        let now = self.time_ms();
        let mut pinged = false;
        for node in self.peers() {
            if now - node.last_receive() > timeout {
                info!(
                    "ping node {} last seen {}",
                    node.id(),
                    node.last_receive()
                );
                let _ = node.send(&empty_node_frame(NodeCommand::Ping));
                pinged = true;
            }
        }
        pinged
    }

    // ------------------------------------------------------------------
    // listeners
    // ------------------------------------------------------------------

    /// Open another listener and announce it to every connected node.
    pub fn add_listener(
        self: &Arc<Self>,
        description: ConnectionDescription,
    ) -> Result<Arc<dyn Connection>, NodeError> {
        debug_assert!(self.is_listening());
        let connection =
            self.transports
                .listen(&description)
                .map_err(|source| NodeError::Listen {
                    descriptor: description.to_string(),
                    source,
                })?;

        let token = self.listener_tokens.fetch_add(1, Ordering::Relaxed);
        self.pending_listeners
            .lock()
            .insert(token, Arc::clone(&connection));

        // everyone updates their description list of us; we install the
        // connection in our own handler
        let frame = AddListenerPayload {
            token,
            description: description.to_string(),
        }
        .frame();
        for node in self.connected_nodes() {
            let _ = node.send(&frame);
        }
        Ok(connection)
    }

    /// Withdraw listeners from every peer, then close them.
    pub fn remove_listeners(self: &Arc<Self>, connections: Vec<Arc<dyn Connection>>) {
        debug_assert!(self.is_listening());
        let mut requests = Vec::with_capacity(connections.len());
        for connection in &connections {
            debug_assert!(!connection.is_connected());
            let token = self.listener_tokens.fetch_add(1, Ordering::Relaxed);
            self.pending_listeners
                .lock()
                .insert(token, Arc::clone(connection));
            let request = self.requests.register();
            let frame = RemoveListenerPayload {
                request_id: request,
                token,
                description: connection.description().to_string(),
            }
            .frame();
            for node in self.connected_nodes() {
                let _ = node.send(&frame);
            }
            requests.push(request);
        }
        for (request, connection) in requests.into_iter().zip(connections) {
            let _ = self.requests.wait(request, self.request_timeout());
            connection.close();
        }
    }

    // ------------------------------------------------------------------
    // send token
    // ------------------------------------------------------------------

    /// Block until `node` grants the cluster-wide send token.
    pub fn acquire_send_token(self: &Arc<Self>, node: &Arc<Node>) -> Option<SendToken> {
        debug_assert!(!self.in_receiver_thread());
        debug_assert!(!self.in_command_thread());

        let request = self.requests.register();
        let frame = SendTokenPayload {
            request_id: request,
        }
        .frame(NodeCommand::AcquireSendToken);
        if node.send(&frame).is_err() {
            return None;
        }
        match self.requests.wait(request, self.request_timeout()) {
            Ok(_) => Some(SendToken {
                node: Arc::clone(node),
            }),
            Err(_) => {
                error!("timeout while acquiring send token {request}");
                None
            }
        }
    }

    /// Return the token to its holder. Releasing twice is harmless.
    pub fn release_send_token(&self, token: SendToken) {
        debug_assert!(!self.in_receiver_thread());
        let _ = token
            .node
            .send(&empty_node_frame(NodeCommand::ReleaseSendToken));
    }

    // ------------------------------------------------------------------
    // objects
    // ------------------------------------------------------------------

    pub fn register_object(&self, object: Arc<dyn Object>) -> Result<ObjectId, ObjectError> {
        self.object_store.register_object(object)
    }

    pub fn deregister_object(&self, id: ObjectId) -> Result<(), ObjectError> {
        self.object_store.deregister_object(id)
    }

    /// Attach a slave replica and drain any commands deferred for it.
    pub fn map_object(
        &self,
        object: Arc<dyn Object>,
        id: ObjectId,
        version: Version,
        master: Option<NodeId>,
    ) -> Result<(), ObjectError> {
        self.object_store.map_object(object, id, version, master)?;
        self.flush_commands();
        Ok(())
    }

    pub fn unmap_object(&self, id: ObjectId) -> Result<(), ObjectError> {
        self.object_store.unmap_object(id)
    }

    /// Drop master or slave attachment, whichever `id` has.
    pub fn release_object(&self, id: ObjectId) -> Result<(), ObjectError> {
        if self.object_store.is_master(id) {
            self.object_store.deregister_object(id)
        } else {
            self.object_store.unmap_object(id)
        }
    }

    pub fn sync_object(&self, id: ObjectId, version: Version) -> Result<Version, ObjectError> {
        self.object_store.sync_object(id, version)
    }

    pub fn enable_send_on_register(&self) {
        self.object_store.enable_send_on_register();
    }

    pub fn disable_send_on_register(&self) {
        self.object_store.disable_send_on_register();
    }

    pub fn register_push_handler(&self, group: u128, handler: PushHandler) {
        self.push_handlers.lock().insert(group, handler);
    }

    /// Deliver pushed object data to the handler registered for `group`.
    pub fn object_push(
        &self,
        group: u128,
        object_type: u128,
        object_id: ObjectId,
        stream: &mut ObjectDataIStream,
    ) {
        let handler = self.push_handlers.lock().get(&group).cloned();
        if let Some(handler) = handler {
            handler(group, object_type, object_id, stream);
        }
        if stream.stream_mut().has_data() {
            warn!("incomplete object push for group {group:#x} object {object_id}");
        }
    }

    // ------------------------------------------------------------------
    // multicast discovery
    // ------------------------------------------------------------------

    /// After the handshake, elect a multicast connection shared with the
    /// peer; further matches become auxiliary groups.
    fn connect_multicast(&self, node: &Arc<Node>) {
        debug_assert!(self.in_receiver_thread());
        let own_groups = self.node.with_multicast(|mc| mc.groups.clone());
        if own_groups.is_empty() {
            return;
        }
        let peer_descriptions = node.descriptions();

        node.with_multicast(|mc| {
            if mc.elected.is_some() {
                return; // already elected through NODE_ID
            }
            for candidate in &own_groups {
                let description = candidate.description().clone();
                let shared = peer_descriptions
                    .iter()
                    .any(|d| description.is_same_multicast_group(d));
                if !shared {
                    continue;
                }
                if mc.elected.is_none() {
                    info!(
                        "using {description} as multicast group for {}",
                        node.id()
                    );
                    mc.elected = Some(Arc::clone(candidate));
                } else {
                    info!(
                        "adding {description} as auxiliary group for {}",
                        node.id()
                    );
                    mc.groups.push(Arc::clone(candidate));
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // command handlers
    // ------------------------------------------------------------------

    fn cmd_ack_request(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        let Ok(payload) = AckRequestPayload::read(cmd) else {
            warn!("malformed ACK_REQUEST");
            return true;
        };
        debug_assert!(payload.request_id != UNDEFINED_REQUEST);
        local.requests.serve(payload.request_id, RequestValue::Unit);
        true
    }

    fn cmd_stop_rcv(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        debug_assert_eq!(local.node.state(), NodeState::Listening);
        info!("cmd stop receiver {}", local.id());

        local.node.set_state(NodeState::Closing); // receiver loop exits

        let mut stop = cmd.clone();
        stop.set_command(NodeCommand::StopCmd); // command thread exits
        local.dispatch_command_retained(stop);
        true
    }

    fn cmd_stop_cmd(local: &Arc<LocalNode>, _cmd: &mut Command) -> bool {
        debug_assert!(local.in_command_thread());
        debug_assert_eq!(local.node.state(), NodeState::Closing);
        info!("cmd stop command {}", local.id());

        // outstanding send-token acquirers fail through their timeouts
        {
            let mut state = local.send_token.lock();
            state.queue.clear();
            state.available = true;
        }
        local.node.set_state(NodeState::Closed);
        true
    }

    fn cmd_connect(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(cmd.node().is_none());
        debug_assert!(local.in_receiver_thread());
        let Some(connection) = cmd.connection() else {
            return true;
        };
        let Ok(payload) = ConnectPayload::read(cmd) else {
            warn!("malformed CONNECT");
            return true;
        };
        let node_id = payload.node_id;
        trace!("handle connect from {node_id}");
        debug_assert!(node_id != local.id());

        if let Some(existing) = local.get_node(node_id) {
            if existing.is_connected() {
                // simultaneous connect from the peer: refuse this one
                info!("already got node {node_id}, refusing connect");
                let reply = ConnectReplyPayload {
                    request_id: payload.request_id,
                    node_id: NodeId::ZERO,
                    kind: local.node.kind(),
                    info: String::new(),
                }
                .frame(NodeCommand::ConnectReply);
                let _ = connection.send(&reply);
                local.remove_connection_inner(&connection);
                return true;
            }
        }

        let Some(info) = NodeInfo::parse(&payload.info) else {
            warn!("error during node initialization");
            return true;
        };
        let remote = match local.get_node(node_id) {
            Some(node) => {
                node.apply_info(&info);
                node
            }
            None => Node::from_info(&info),
        };
        debug_assert_eq!(remote.id(), node_id);

        remote.set_outgoing(Arc::clone(&connection));
        remote.set_state(NodeState::Connected);
        {
            let mut nodes = local.nodes.write();
            local
                .connection_nodes
                .lock()
                .insert(connection.id(), Arc::clone(&remote));
            nodes.insert(node_id, Arc::clone(&remote));
        }
        trace!("added node {node_id}");

        let reply = ConnectReplyPayload {
            request_id: payload.request_id,
            node_id: local.id(),
            kind: local.node.kind(),
            info: local.node.info().serialize(),
        }
        .frame(NodeCommand::ConnectReply);
        let _ = connection.send(&reply);
        true
    }

    fn cmd_connect_reply(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(cmd.node().is_none());
        debug_assert!(local.in_receiver_thread());
        let Some(connection) = cmd.connection() else {
            return true;
        };
        let Ok(payload) = ConnectReplyPayload::read(cmd) else {
            warn!("malformed CONNECT_REPLY");
            return true;
        };
        trace!("handle connect reply from {}", payload.node_id);

        // connection refused
        if payload.node_id.is_zero() {
            info!("connection refused, node already connected by peer");
            local.remove_connection_inner(&connection);
            if let Some(candidate) = local.requests.data(payload.request_id) {
                candidate.set_state(NodeState::Closed);
            }
            local
                .requests
                .serve(payload.request_id, RequestValue::Bool(false));
            return true;
        }

        if let Some(peer) = local.get_node(payload.node_id) {
            if peer.is_connected() {
                // simultaneous connect crossed on the wire: each side may
                // hold a connection the other considers failed, so drop
                // this connection and the crossed mapping both. The
                // caller's randomized retry converges on one connection.
                info!("closing simultaneous connection to {}", payload.node_id);
                local.remove_connection_inner(&connection);
                peer.set_state(NodeState::Closed);
                if let Some(established) = peer.take_outgoing() {
                    local.connection_nodes.lock().remove(&established.id());
                    local.remove_connection_inner(&established);
                }
                local.nodes.write().remove(&payload.node_id);
                if let Some(candidate) = local.requests.data(payload.request_id) {
                    candidate.set_state(NodeState::Closed);
                }
                local
                    .requests
                    .serve(payload.request_id, RequestValue::Bool(false));
                return true;
            }
        }

        let peer = match local.requests.data(payload.request_id) {
            Some(candidate) => candidate,
            None => match local.get_node(payload.node_id) {
                Some(node) => node,
                None => {
                    let Some(info) = NodeInfo::parse(&payload.info) else {
                        warn!("error during node initialization");
                        local
                            .requests
                            .serve(payload.request_id, RequestValue::Bool(false));
                        return true;
                    };
                    Node::from_info(&info)
                }
            },
        };
        if let Some(info) = NodeInfo::parse(&payload.info) {
            peer.apply_info(&info);
        }
        debug_assert_eq!(peer.id(), payload.node_id);

        peer.set_outgoing(Arc::clone(&connection));
        peer.set_state(NodeState::Connected);
        {
            let mut nodes = local.nodes.write();
            local
                .connection_nodes
                .lock()
                .insert(connection.id(), Arc::clone(&peer));
            nodes.insert(peer.id(), Arc::clone(&peer));
        }
        trace!("added node {}", payload.node_id);

        local
            .requests
            .serve(payload.request_id, RequestValue::Bool(true));

        let _ = peer.send(&empty_node_frame(NodeCommand::ConnectAck));
        local.connect_multicast(&peer);
        true
    }

    fn cmd_connect_ack(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        let Some(node) = cmd.node() else {
            warn!("CONNECT_ACK from unknown node");
            return true;
        };
        trace!("handle connect ack from {}", node.id());
        local.connect_multicast(&node);
        true
    }

    fn cmd_id(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        let Some(connection) = cmd.connection() else {
            return true;
        };
        if let Some(node) = cmd.node() {
            // connection already mapped by an earlier identity packet
            debug_assert!(node.with_multicast(|mc| mc.elected.is_some()));
            return true;
        }
        let Ok(payload) = NodeIdPayload::read(cmd) else {
            warn!("malformed NODE_ID");
            return true;
        };
        let node_id = payload.node_id;
        info!("handle ID for node {node_id}");

        let node = if node_id == local.id() {
            Arc::clone(&local.node)
        } else {
            match local.get_node(node_id) {
                Some(node) => node,
                None => {
                    // unknown node: create and track it unconnected
                    let Some(info) = NodeInfo::parse(&payload.info) else {
                        warn!("error during node initialization");
                        return true;
                    };
                    let node = Node::from_info(&info);
                    local.nodes.write().insert(node_id, Arc::clone(&node));
                    trace!("added node {node_id} with multicast {connection:?}", connection = connection.id());
                    node
                }
            }
        };
        debug_assert_eq!(node.id(), node_id);

        node.with_multicast(|mc| {
            let known = mc.groups.iter().position(|c| c.id() == connection.id());
            match &mc.elected {
                Some(elected) if elected.id() == connection.id() => {
                    debug_assert!(known.is_none());
                }
                Some(_) => {
                    // another connection is elected; keep this auxiliary
                    if known.is_none() {
                        mc.groups.push(Arc::clone(&connection));
                    }
                }
                None => {
                    mc.elected = Some(Arc::clone(&connection));
                    if let Some(index) = known {
                        mc.groups.remove(index);
                    }
                }
            }
        });

        local
            .connection_nodes
            .lock()
            .insert(connection.id(), node);
        info!("added multicast connection from {node_id} to {}", local.id());
        true
    }

    fn cmd_disconnect(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        let Ok(payload) = DisconnectPayload::read(cmd) else {
            return true;
        };
        let Some(node) = local.requests.data(payload.request_id) else {
            local.requests.serve(payload.request_id, RequestValue::Unit);
            return true;
        };

        if let Some(connection) = node.take_outgoing() {
            node.set_state(NodeState::Closed);
            local.object_store.remove_node(node.id());
            {
                let mut nodes = local.nodes.write();
                local.connection_nodes.lock().remove(&connection.id());
                nodes.remove(&node.id());
            }
            local.remove_connection_inner(&connection);
            info!("{node:?} disconnected from {}", local.id());
        }

        debug_assert!(node.is_closed());
        local.requests.serve(payload.request_id, RequestValue::Unit);
        true
    }

    fn cmd_get_node_data(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        let Ok(payload) = GetNodeDataPayload::read(cmd) else {
            return true;
        };
        trace!("cmd get node data for {}", payload.node_id);
        let Some(to_node) = cmd.node() else {
            return true;
        };

        let reply = match local.get_node(payload.node_id) {
            Some(node) => {
                let info = node.info().serialize();
                info!(
                    "sent node data '{info}' for {} to {}",
                    payload.node_id,
                    to_node.id()
                );
                GetNodeDataReplyPayload {
                    request_id: payload.request_id,
                    node_id: payload.node_id,
                    kind: node.kind(),
                    info,
                }
            }
            None => {
                trace!("node {} unknown", payload.node_id);
                GetNodeDataReplyPayload {
                    request_id: payload.request_id,
                    node_id: payload.node_id,
                    kind: NodeKind::Invalid,
                    info: String::new(),
                }
            }
        };
        let _ = to_node.send(&reply.frame());
        true
    }

    fn cmd_get_node_data_reply(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        let Ok(payload) = GetNodeDataReplyPayload::read(cmd) else {
            return true;
        };
        trace!("cmd get node data reply for {}", payload.node_id);

        if let Some(node) = local.get_node(payload.node_id) {
            // requested node connected to us in the meantime
            local
                .requests
                .serve(payload.request_id, RequestValue::Node(Some(node)));
            return true;
        }

        if payload.kind == NodeKind::Invalid {
            local
                .requests
                .serve(payload.request_id, RequestValue::Node(None));
            return true;
        }

        let node = match NodeInfo::parse(&payload.info) {
            Some(info) => Some(Node::from_info(&info)),
            None => {
                warn!("failed to initialize node data");
                None
            }
        };
        local
            .requests
            .serve(payload.request_id, RequestValue::Node(node));
        true
    }

    fn cmd_acquire_send_token(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_command_thread());

        {
            let mut state = local.send_token.lock();
            if !state.available {
                let timeout = local.globals.timeout_ms;
                if timeout == TIMEOUT_INDEFINITE
                    || local.time_ms() - state.last_grant <= timeout as i64
                {
                    // no token available, enqueue in arrival order
                    state.queue.push_back(cmd.clone());
                    return true;
                }
                // the holder went stale: drop old requests, grant anew
                state.queue.clear();
            }
            state.available = false;
        }

        let Ok(payload) = SendTokenPayload::read(cmd) else {
            return true;
        };
        if let Some(node) = cmd.node() {
            let reply = SendTokenPayload {
                request_id: payload.request_id,
            }
            .frame(NodeCommand::AcquireSendTokenReply);
            let _ = node.send(&reply);
        }
        true
    }

    fn cmd_acquire_send_token_reply(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        let Ok(payload) = SendTokenPayload::read(cmd) else {
            return true;
        };
        local.requests.serve(payload.request_id, RequestValue::Unit);
        true
    }

    fn cmd_release_send_token(local: &Arc<LocalNode>, _cmd: &mut Command) -> bool {
        debug_assert!(local.in_command_thread());

        let mut request = {
            let mut state = local.send_token.lock();
            state.last_grant = local.time_ms();
            if state.available {
                return true; // double release due to timeout
            }
            match state.queue.pop_front() {
                None => {
                    state.available = true;
                    return true;
                }
                Some(request) => request,
            }
        };

        let Ok(payload) = SendTokenPayload::read(&mut request) else {
            return true;
        };
        if let Some(node) = request.node() {
            let reply = SendTokenPayload {
                request_id: payload.request_id,
            }
            .frame(NodeCommand::AcquireSendTokenReply);
            let _ = node.send(&reply);
        }
        true
    }

    fn cmd_add_listener(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        let Ok(payload) = AddListenerPayload::read(cmd) else {
            return true;
        };
        let Some(sender) = cmd.node() else {
            return true;
        };
        let Some(description) = ConnectionDescription::from_str_with_port(
            &payload.description,
            local.globals.default_port,
        ) else {
            warn!("bad listener description '{}'", payload.description);
            return true;
        };
        sender.add_description(description.clone());

        if sender.id() != local.id() {
            return true;
        }

        // our own announcement: install the pre-opened connection
        let Some(connection) = local.pending_listeners.lock().remove(&payload.token) else {
            return true;
        };
        local
            .connection_nodes
            .lock()
            .insert(connection.id(), Arc::clone(&local.node));
        if description.kind.is_multicast() {
            local
                .node
                .with_multicast(|mc| mc.groups.push(Arc::clone(&connection)));
        }
        local.incoming.add_connection(connection);
        true
    }

    fn cmd_remove_listener(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_receiver_thread());
        let Ok(payload) = RemoveListenerPayload::read(cmd) else {
            return true;
        };
        let Some(sender) = cmd.node() else {
            return true;
        };
        let Some(description) = ConnectionDescription::from_str_with_port(
            &payload.description,
            local.globals.default_port,
        ) else {
            return true;
        };
        sender.remove_description(&description);

        if sender.id() != local.id() {
            return true;
        }

        if let Some(connection) = local.pending_listeners.lock().remove(&payload.token) {
            if connection.description().kind.is_multicast() {
                local.node.with_multicast(|mc| {
                    mc.groups.retain(|c| c.id() != connection.id());
                });
            }
            local.incoming.remove_connection(&connection);
            local.connection_nodes.lock().remove(&connection.id());
        }
        local.requests.serve(payload.request_id, RequestValue::Unit);
        true
    }

    fn cmd_ping(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_command_thread());
        if let Some(node) = cmd.node() {
            let _ = node.send(&empty_node_frame(NodeCommand::PingReply));
        }
        true
    }

    fn cmd_discard(_local: &Arc<LocalNode>, _cmd: &mut Command) -> bool {
        true
    }

    fn cmd_remove_node(local: &Arc<LocalNode>, cmd: &mut Command) -> bool {
        debug_assert!(local.in_command_thread());
        let Ok(payload) = RemoveNodePayload::read(cmd) else {
            return true;
        };
        local.object_store.remove_node(payload.node_id);
        true
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        debug_assert!(
            self.node.state() != NodeState::Listening,
            "local node dropped while listening"
        );
    }
}
