pub mod error;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{error, info, warn};

use crate::{
    compression::CompressionConfig,
    connection::ConnectionRef,
    constants::{INBOUND_QUEUE_LIMIT, PROTOCOL_VERSION},
    dispatch::{Dispatcher, PacketHandler, TargetKind},
    node::{Node, NodeDescriptor, NodeError, NodeState},
    object::{ApplyOutcome, ObjectHandle, ObjectRef, ObjectRegistry, Role},
    packet::{
        read_packet, Packet, ProtocolError, ReadPacketError, CMD_HANDSHAKE, CMD_HANDSHAKE_ACK,
        CMD_NODE_STOP, CMD_OBJECT_COMMIT, CMD_OBJECT_RESYNC, CMD_OBJECT_SNAPSHOT,
    },
    queue::BlockingQueue,
    types::{CommandId, NodeId, ObjectId, SessionId, Version},
};

pub use error::SessionError;

/// Launches remote node processes. How processes are spawned (local fork,
/// remote shell, resource manager) is outside the core; implementors receive
/// the expanded launch command.
pub trait NodeLauncher: Send + Sync {
    fn launch(&self, node: &NodeDescriptor, command: &str) -> Result<(), String>;
}

/// Session-level configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub protocol_version: u16,
    /// Offered on every connection; used only when both peers advertise it
    /// (and the `zstd_support` feature is compiled in).
    pub compression: Option<CompressionConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            compression: None,
        }
    }
}

/// A state change the application can react to. A lost node arrives here as
/// a transition to `Stopped`, never as a cross-thread panic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    NodeStateChanged {
        node: NodeId,
        old: NodeState,
        new: NodeState,
    },
}

/// What connection reader threads push to the application thread.
enum Inbound {
    Packet { from: NodeId, packet: Packet },
    ConnectionLost { from: NodeId },
}

/// One distributed session: the set of peer nodes, the command dispatcher and
/// the versioned object registry, plus the threads that feed them.
///
/// One reader thread per attached connection decodes framed packets into the
/// session's inbound queue; the application thread drains it via
/// [`process`](Self::process). Outbound writes are serialized per connection
/// by the connection itself.
pub struct Session {
    id: SessionId,
    local_node: NodeId,
    config: SessionConfig,
    nodes: Mutex<HashMap<NodeId, Node>>,
    registry: Mutex<ObjectRegistry>,
    dispatcher: Mutex<Dispatcher>,
    inbound: Arc<BlockingQueue<Inbound>>,
    pending_events: Mutex<Vec<SessionEvent>>,
    launcher: Option<Box<dyn NodeLauncher>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(feature = "zstd_support")]
    encoder: Mutex<Option<crate::compression::Encoder>>,
}

impl Session {
    pub fn new(
        local_node: NodeId,
        config: SessionConfig,
        launcher: Option<Box<dyn NodeLauncher>>,
    ) -> Self {
        Self {
            id: fastrand::u64(1..),
            local_node,
            #[cfg(feature = "zstd_support")]
            encoder: Mutex::new(
                config
                    .compression
                    .as_ref()
                    .and_then(|cc| crate::compression::Encoder::try_new(cc).ok()),
            ),
            config,
            nodes: Mutex::new(HashMap::new()),
            registry: Mutex::new(ObjectRegistry::new()),
            dispatcher: Mutex::new(Dispatcher::new()),
            inbound: Arc::new(BlockingQueue::bounded(INBOUND_QUEUE_LIMIT)),
            pending_events: Mutex::new(Vec::new()),
            launcher,
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    // ---------------------------------------------------------------- nodes

    /// Make the session aware of a peer. The node starts `Stopped`.
    pub fn add_node(&self, node: NodeId, descriptor: NodeDescriptor) -> Result<(), SessionError> {
        let mut nodes = lock(&self.nodes);
        if nodes.contains_key(&node) {
            return Err(SessionError::DuplicateNode { node });
        }
        nodes.insert(node, Node::new(node, descriptor));
        Ok(())
    }

    pub fn node_state(&self, node: NodeId) -> Result<NodeState, SessionError> {
        Ok(self.with_node(node, |node| node.state())?)
    }

    /// `Stopped -> Initialized`: register launch parameters.
    pub fn init_node(&self, node: NodeId, descriptor: NodeDescriptor) -> Result<(), SessionError> {
        self.with_node_mut(node, |entry, events| -> Result<(), NodeError> {
            let old = entry.state();
            entry.initialize(descriptor)?;
            push_state_change(events, node, old, entry.state());
            Ok(())
        })??;
        Ok(())
    }

    /// `Initialized -> Launched`: start the remote process through the
    /// launcher capability.
    pub fn launch_node(&self, node: NodeId, program: &str) -> Result<(), SessionError> {
        let launcher = self.launcher.as_deref().ok_or(SessionError::NoLauncher)?;

        let (descriptor, command) = self.with_node(node, |entry| {
            entry
                .launch_command(program)
                .map(|command| (entry.descriptor().clone(), command))
        })??;

        launcher
            .launch(&descriptor, &command)
            .map_err(|detail| SessionError::LaunchFailed { node, detail })?;

        self.with_node_mut(node, |entry, events| -> Result<(), NodeError> {
            let old = entry.state();
            entry.mark_launched()?;
            push_state_change(events, node, old, entry.state());
            Ok(())
        })??;
        Ok(())
    }

    /// Attach an open connection to a node that is already running remotely
    /// and mark it `Running` immediately (`Initialized -> Running`, skipping
    /// launch). Sends the handshake and starts the reader thread.
    pub fn set_started(
        &self,
        node: NodeId,
        connection: ConnectionRef,
    ) -> Result<(), SessionError> {
        self.attach(node, connection, true)
    }

    /// Attach the connection of a previously launched node
    /// (`Launched -> Running` happens once the peer's handshake arrives).
    pub fn attach_connection(
        &self,
        node: NodeId,
        connection: ConnectionRef,
    ) -> Result<(), SessionError> {
        self.attach(node, connection, false)
    }

    fn attach(
        &self,
        node: NodeId,
        connection: ConnectionRef,
        mark_running: bool,
    ) -> Result<(), SessionError> {
        self.with_node_mut(node, |entry, events| -> Result<(), NodeError> {
            // Connections may only be attached on the way up.
            let old = entry.state();
            if !matches!(old, NodeState::Initialized | NodeState::Launched) {
                return Err(NodeError::InvalidTransition {
                    node,
                    from: old,
                    to: NodeState::Running,
                });
            }
            entry.attach_connection(Arc::clone(&connection))?;
            if mark_running {
                entry.mark_running()?;
                push_state_change(events, node, old, entry.state());
            }
            Ok(())
        })??;

        if let Err(handshake_error) = self.send_handshake(&connection, CMD_HANDSHAKE) {
            let _ = self.stop_node_internal(node);
            return Err(handshake_error);
        }
        self.spawn_reader(node, connection);
        Ok(())
    }

    /// Stop a node from any state: closes its connections, discards its
    /// subscriptions (a restart is fully resynchronized, never diffed) and
    /// surfaces the transition as an event.
    pub fn stop_node(&self, node: NodeId) -> Result<(), SessionError> {
        // Best-effort graceful notice; the peer may already be gone.
        if let Ok(connection) = self.running_connection(node) {
            let _ = self.write_packet(&connection, Packet::new(CMD_NODE_STOP, Vec::new()), false);
        }
        self.stop_node_internal(node)
    }

    fn stop_node_internal(&self, node: NodeId) -> Result<(), SessionError> {
        self.with_node_mut(node, |entry, events| {
            let old = entry.state();
            entry.stop();
            if old != NodeState::Stopped {
                push_state_change(events, node, old, NodeState::Stopped);
            }
        })?;
        lock(&self.registry).unsubscribe_node(node);
        // Readers whose connection is gone have exited; reap them here so the
        // handle list does not grow for the session's lifetime.
        lock(&self.readers).retain(|reader| !reader.is_finished());
        Ok(())
    }

    // -------------------------------------------------------------- packets

    /// Register a handler for an application command.
    pub fn on_packet(
        &self,
        command: CommandId,
        target: TargetKind,
        handler: PacketHandler,
    ) -> Result<(), SessionError> {
        lock(&self.dispatcher).register_handler(command, target, handler)?;
        Ok(())
    }

    /// Send an application packet to a `Running` node.
    pub fn send_packet(
        &self,
        node: NodeId,
        command: CommandId,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.send_object_packet(node, command, crate::types::NO_OBJECT, payload)
    }

    fn send_object_packet(
        &self,
        node: NodeId,
        command: CommandId,
        object_id: ObjectId,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        let (connection, compress) = self.with_node(node, |entry| {
            entry
                .running_connection()
                .map(|connection| (Arc::clone(connection), entry.peer_compression))
        })??;
        self.write_packet(
            &connection,
            Packet::to_object(command, object_id, payload),
            compress,
        )
    }

    // -------------------------------------------------------------- objects

    /// Register a distributed object under a stable id. Packets that were
    /// waiting for this object are re-delivered immediately.
    pub fn register_object(
        &self,
        id: ObjectId,
        object: ObjectRef,
        role: Role,
    ) -> Result<ObjectHandle, SessionError> {
        let handle = lock(&self.registry).register(id, object, role)?;

        let parked = lock(&self.dispatcher).take_parked(id);
        for (from, packet) in parked {
            self.handle_packet(from, packet);
        }
        Ok(handle)
    }

    pub fn deregister_object(&self, handle: ObjectHandle) -> Result<(), SessionError> {
        lock(&self.registry).deregister(handle.id())?;
        Ok(())
    }

    pub fn object_version(&self, handle: ObjectHandle) -> Result<Version, SessionError> {
        Ok(lock(&self.registry).version(handle.id())?)
    }

    /// Commit the object's dirty fields and fan the delta out to every
    /// subscribed node. The local version advances synchronously; no
    /// acknowledgments are awaited. No-op when nothing is dirty.
    pub fn commit(&self, handle: ObjectHandle) -> Result<Version, SessionError> {
        let outgoing = lock(&self.registry).commit(handle)?;
        let Some(outgoing) = outgoing else {
            return self.object_version(handle);
        };

        for subscriber in &outgoing.subscribers {
            if let Err(error) = self.send_object_packet(
                *subscriber,
                CMD_OBJECT_COMMIT,
                outgoing.object_id,
                outgoing.payload.clone(),
            ) {
                warn!(
                    "commit of object {} v{} not delivered to node {subscriber}: {error}",
                    outgoing.object_id, outgoing.version
                );
            }
        }
        Ok(outgoing.version)
    }

    /// Subscribe a `Running` node to an authority-side object. The node
    /// immediately receives a full snapshot tagged with the current version,
    /// never a delta chain.
    pub fn subscribe(&self, node: NodeId, handle: ObjectHandle) -> Result<(), SessionError> {
        // Fail before touching the fan-out list if the node cannot be sent to.
        let _ = self.running_connection(node)?;

        let snapshot = lock(&self.registry).subscribe(node, handle)?;
        self.send_object_packet(
            node,
            CMD_OBJECT_SNAPSHOT,
            snapshot.object_id,
            snapshot.payload,
        )
    }

    pub fn unsubscribe(&self, node: NodeId, handle: ObjectHandle) -> Result<(), SessionError> {
        lock(&self.registry).unsubscribe(node, handle)?;
        Ok(())
    }

    // ------------------------------------------------------------- the loop

    /// Drain and handle inbound packets for up to `timeout`, returning the
    /// state changes the application should react to. Built-in protocol
    /// commands are handled internally; application commands go to their
    /// registered handlers, synchronously on this thread.
    pub fn process(&self, timeout: Duration) -> Vec<SessionEvent> {
        lock(&self.dispatcher).drop_expired(Instant::now());

        if let Some(first) = self.inbound.pop_timeout(timeout) {
            self.handle_inbound(first);
            while let Some(next) = self.inbound.try_pop() {
                self.handle_inbound(next);
            }
        }

        std::mem::take(&mut *lock(&self.pending_events))
    }

    fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Packet { from, packet } => self.handle_packet(from, packet),
            Inbound::ConnectionLost { from } => {
                info!("connection to node {from} lost");
                let _ = self.stop_node_internal(from);
            }
        }
    }

    fn handle_packet(&self, from: NodeId, packet: Packet) {
        match packet.command() {
            CMD_HANDSHAKE => self.handle_handshake(from, &packet, true),
            CMD_HANDSHAKE_ACK => self.handle_handshake(from, &packet, false),
            CMD_NODE_STOP => {
                info!("node {from} announced stop");
                let _ = self.stop_node_internal(from);
            }
            CMD_OBJECT_COMMIT => self.handle_object_commit(from, packet),
            CMD_OBJECT_SNAPSHOT => self.handle_object_snapshot(from, packet),
            CMD_OBJECT_RESYNC => self.handle_resync_request(from, &packet),
            _ => {
                let resolved = {
                    let mut dispatcher = lock(&self.dispatcher);
                    let registry = &self.registry;
                    dispatcher.resolve(from, packet, &|id| lock(registry).contains(id))
                };
                match resolved {
                    // The dispatcher lock is released before the callback
                    // runs, so handlers may register handlers or objects.
                    Ok((handler, packet)) => {
                        let mut callback = lock(&*handler);
                        (*callback)(from, &packet);
                    }
                    Err(dispatch_error) => {
                        // Per-packet problem: log, drop, keep the connection.
                        warn!("packet from node {from} not dispatched: {dispatch_error}");
                    }
                }
            }
        }
    }

    fn handle_handshake(&self, from: NodeId, packet: &Packet, reply: bool) {
        let Some(handshake) = Handshake::decode(packet.payload()) else {
            warn!("malformed handshake from node {from}, stopping it");
            let _ = self.stop_node_internal(from);
            return;
        };

        if handshake.protocol_version != self.config.protocol_version {
            error!(
                "node {from} speaks protocol {} but this session speaks {}, refusing",
                handshake.protocol_version, self.config.protocol_version
            );
            let _ = self.stop_node_internal(from);
            return;
        }
        if handshake.node_id != from {
            warn!(
                "connection attached to node {from} identifies as node {}; check session config",
                handshake.node_id
            );
        }
        info!(
            "handshake from node {from}, session {:016x}",
            handshake.session_id
        );

        let connection = self.with_node_mut(from, |entry, events| {
            entry.peer_compression = handshake.compression;
            if entry.state() != NodeState::Running {
                let old = entry.state();
                if entry.mark_running().is_ok() {
                    push_state_change(events, from, old, NodeState::Running);
                }
            }
            entry.any_connection().cloned()
        });

        if reply {
            if let Ok(Some(connection)) = connection {
                if let Err(send_error) = self.send_handshake(&connection, CMD_HANDSHAKE_ACK) {
                    warn!("handshake ack to node {from} failed: {send_error}");
                }
            }
        }
    }

    fn handle_object_commit(&self, from: NodeId, packet: Packet) {
        let id = packet.object_id();
        if !lock(&self.registry).contains(id) {
            lock(&self.dispatcher).park(from, packet);
            return;
        }
        let outcome = lock(&self.registry).apply_commit(id, from, packet.payload());
        match outcome {
            Ok(ApplyOutcome::NeedResync { expected, received }) => {
                warn!(
                    "object {id}: version gap (expected {expected}, received {received}), \
                     requesting resync from node {from}"
                );
                if let Err(send_error) =
                    self.send_object_packet(from, CMD_OBJECT_RESYNC, id, Vec::new())
                {
                    warn!("resync request for object {id} failed: {send_error}");
                }
            }
            Ok(_) => {}
            Err(apply_error) => warn!("commit for object {id} dropped: {apply_error}"),
        }
    }

    fn handle_object_snapshot(&self, from: NodeId, packet: Packet) {
        let id = packet.object_id();
        if !lock(&self.registry).contains(id) {
            lock(&self.dispatcher).park(from, packet);
            return;
        }
        if let Err(apply_error) = lock(&self.registry).apply_snapshot(id, from, packet.payload())
        {
            warn!("snapshot for object {id} dropped: {apply_error}");
        }
    }

    fn handle_resync_request(&self, from: NodeId, packet: &Packet) {
        let id = packet.object_id();
        let snapshot = lock(&self.registry).snapshot(id);
        match snapshot {
            Ok(snapshot) => {
                if let Err(send_error) =
                    self.send_object_packet(from, CMD_OBJECT_SNAPSHOT, id, snapshot.payload)
                {
                    warn!("snapshot of object {id} to node {from} failed: {send_error}");
                }
            }
            Err(registry_error) => {
                warn!("node {from} requested resync of object {id}: {registry_error}")
            }
        }
    }

    // ------------------------------------------------------------ internals

    fn send_handshake(
        &self,
        connection: &ConnectionRef,
        command: CommandId,
    ) -> Result<(), SessionError> {
        let handshake = Handshake {
            protocol_version: self.config.protocol_version,
            session_id: self.id,
            node_id: self.local_node,
            compression: self.offers_compression(),
        };
        // Handshakes are never compressed: the peer has not negotiated yet.
        self.write_packet(connection, Packet::new(command, handshake.encode()), false)
    }

    fn offers_compression(&self) -> bool {
        cfg!(feature = "zstd_support") && self.config.compression.is_some()
    }

    /// Encode (optionally compressing) and write one packet. The connection
    /// serializes concurrent writers internally.
    fn write_packet(
        &self,
        connection: &ConnectionRef,
        packet: Packet,
        compress: bool,
    ) -> Result<(), SessionError> {
        #[cfg(feature = "zstd_support")]
        if compress && self.offers_compression() && !packet.payload().is_empty() {
            let mut encoder = lock(&self.encoder);
            if let Some(encoder) = encoder.as_mut() {
                let compressed = encoder
                    .try_encode(packet.payload())
                    .map_err(|encode_error| SessionError::Compression {
                        detail: encode_error.to_string(),
                    })?
                    .to_vec();
                let packet =
                    Packet::to_object(packet.command(), packet.object_id(), compressed);
                connection.write(&packet.to_wire(true))?;
                return Ok(());
            }
        }
        #[cfg(not(feature = "zstd_support"))]
        let _ = compress;

        connection.write(&packet.to_wire(false))?;
        Ok(())
    }

    fn spawn_reader(&self, node: NodeId, connection: ConnectionRef) {
        let inbound = Arc::clone(&self.inbound);
        #[cfg(feature = "zstd_support")]
        let decompression = self.config.compression.clone();

        let reader = thread::spawn(move || {
            #[cfg(feature = "zstd_support")]
            let mut decoder = decompression
                .as_ref()
                .and_then(|cc| crate::compression::Decoder::try_new(cc).ok());
            #[cfg(not(feature = "zstd_support"))]
            let mut decoder = ();

            loop {
                match read_packet(connection.as_ref()) {
                    Ok(wire) => {
                        let packet = if wire.compressed {
                            match decode_compressed(&mut decoder, node, &wire) {
                                Some(packet) => packet,
                                None => continue,
                            }
                        } else {
                            wire.packet
                        };
                        inbound.push(Inbound::Packet { from: node, packet });
                    }
                    Err(ReadPacketError::Connection(_)) => {
                        inbound.push(Inbound::ConnectionLost { from: node });
                        return;
                    }
                    Err(ReadPacketError::Protocol(protocol_error)) => {
                        // A framing violation means the byte stream itself is
                        // desynchronized; the connection cannot be salvaged.
                        error!("stream from node {node} desynchronized: {protocol_error}");
                        connection.close();
                        inbound.push(Inbound::ConnectionLost { from: node });
                        return;
                    }
                }
            }
        });
        lock(&self.readers).push(reader);
    }

    fn running_connection(&self, node: NodeId) -> Result<ConnectionRef, SessionError> {
        Ok(self.with_node(node, |entry| {
            entry.running_connection().map(Arc::clone)
        })??)
    }

    fn with_node<R>(
        &self,
        node: NodeId,
        operation: impl FnOnce(&Node) -> R,
    ) -> Result<R, SessionError> {
        let nodes = lock(&self.nodes);
        let entry = nodes
            .get(&node)
            .ok_or(SessionError::UnknownNode { node })?;
        Ok(operation(entry))
    }

    fn with_node_mut<R>(
        &self,
        node: NodeId,
        operation: impl FnOnce(&mut Node, &mut Vec<SessionEvent>) -> R,
    ) -> Result<R, SessionError> {
        let mut nodes = lock(&self.nodes);
        let entry = nodes
            .get_mut(&node)
            .ok_or(SessionError::UnknownNode { node })?;
        let mut events = Vec::new();
        let result = operation(entry, &mut events);
        drop(nodes);
        if !events.is_empty() {
            lock(&self.pending_events).append(&mut events);
        }
        Ok(result)
    }

    /// Stop every node and join the reader threads.
    pub fn shutdown(&self) {
        let node_ids: Vec<NodeId> = lock(&self.nodes).keys().copied().collect();
        for node in node_ids {
            let _ = self.stop_node_internal(node);
        }
        let readers = std::mem::take(&mut *lock(&self.readers));
        for reader in readers {
            let _ = reader.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "zstd_support")]
fn decode_compressed(
    decoder: &mut Option<crate::compression::Decoder>,
    from: NodeId,
    wire: &crate::packet::WirePacket,
) -> Option<Packet> {
    let command = wire.packet.command();
    let Some(decoder) = decoder.as_mut() else {
        warn!(
            "dropping packet from node {from}: {}",
            ProtocolError::CompressionUnavailable { command }
        );
        return None;
    };
    match decoder.try_decode(wire.packet.payload()) {
        Ok(payload) => Some(Packet::to_object(
            command,
            wire.packet.object_id(),
            payload.to_vec(),
        )),
        Err(decode_error) => {
            warn!("dropping packet from node {from}: {decode_error}");
            None
        }
    }
}

#[cfg(not(feature = "zstd_support"))]
fn decode_compressed(
    _decoder: &mut (),
    from: NodeId,
    wire: &crate::packet::WirePacket,
) -> Option<Packet> {
    warn!(
        "dropping packet from node {from}: {}",
        ProtocolError::CompressionUnavailable {
            command: wire.packet.command(),
        }
    );
    None
}

fn push_state_change(
    events: &mut Vec<SessionEvent>,
    node: NodeId,
    old: NodeState,
    new: NodeState,
) {
    info!("node {node}: {old} -> {new}");
    events.push(SessionEvent::NodeStateChanged { node, old, new });
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handshake payload:
/// `protocol: u16 | session: u64 | node: u64 | compression: u8`, little-endian.
struct Handshake {
    protocol_version: u16,
    session_id: SessionId,
    node_id: NodeId,
    compression: bool,
}

impl Handshake {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(19);
        let _ = payload.write_u16::<LittleEndian>(self.protocol_version);
        let _ = payload.write_u64::<LittleEndian>(self.session_id);
        let _ = payload.write_u64::<LittleEndian>(self.node_id);
        payload.push(self.compression as u8);
        payload
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 19 {
            return None;
        }
        let mut cursor = payload;
        Some(Self {
            protocol_version: cursor.read_u16::<LittleEndian>().ok()?,
            session_id: cursor.read_u64::<LittleEndian>().ok()?,
            node_id: cursor.read_u64::<LittleEndian>().ok()?,
            compression: cursor.read_u8().ok()? != 0,
        })
    }
}
