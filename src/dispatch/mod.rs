pub mod error;

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::warn;

use crate::{
    constants::WAITLIST_TTL,
    packet::{Packet, USER_COMMAND_START},
    types::{CommandId, NodeId, ObjectId},
};

pub use error::DispatchError;

/// Whether a command addresses the session itself or a distributed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Session,
    Object,
}

impl TargetKind {
    fn name(self) -> &'static str {
        match self {
            TargetKind::Session => "session",
            TargetKind::Object => "object",
        }
    }
}

/// Callback invoked synchronously on the dispatching thread.
pub type PacketHandler = Box<dyn FnMut(NodeId, &Packet) + Send>;

/// A registered callback, shared so it can run after the dispatcher lock is
/// released. A handler is therefore free to register more handlers or objects
/// from inside its own invocation.
pub type HandlerRef = Arc<Mutex<PacketHandler>>;

struct Handler {
    target: TargetKind,
    callback: HandlerRef,
}

/// Maximum packets parked per unresolved object id before the oldest is
/// dropped (backpressure instead of unbounded growth).
const WAITLIST_CAP: usize = 64;

/// Packets that arrived for an object id not registered yet.
///
/// New-object setup is not globally ordered: a commit can overtake the packet
/// that announces the object. Parked packets are re-delivered when the object
/// registers and dropped with an error once their retry window lapses.
pub struct PacketWaitlist {
    waiting: HashMap<ObjectId, VecDeque<(Instant, NodeId, Packet)>>,
    ttl: Duration,
}

impl PacketWaitlist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            waiting: HashMap::new(),
            ttl,
        }
    }

    pub fn park(&mut self, from: NodeId, packet: Packet) {
        let queue = self.waiting.entry(packet.object_id()).or_default();
        if queue.len() >= WAITLIST_CAP {
            if let Some((_, node, dropped)) = queue.pop_front() {
                warn!(
                    "waitlist for object {} full, dropping oldest packet (command {} from node {node})",
                    dropped.object_id(),
                    dropped.command()
                );
            }
        }
        queue.push_back((Instant::now(), from, packet));
    }

    /// Packets whose target object just became known, in arrival order.
    pub fn flush_ready(&mut self, object_id: ObjectId) -> Vec<(NodeId, Packet)> {
        match self.waiting.remove(&object_id) {
            Some(queue) => queue.into_iter().map(|(_, node, packet)| (node, packet)).collect(),
            None => Vec::new(),
        }
    }

    /// Drop parked packets whose retry window has lapsed. Returns how many
    /// were dropped.
    pub fn drop_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut dropped = 0;
        self.waiting.retain(|object_id, queue| {
            while let Some((parked_at, _, _)) = queue.front() {
                if now.duration_since(*parked_at) < ttl {
                    break;
                }
                if let Some((_, node, packet)) = queue.pop_front() {
                    warn!(
                        "dropping packet for object {object_id} (command {} from node {node}): \
                         object never registered within {:?}",
                        packet.command(),
                        ttl
                    );
                    dropped += 1;
                }
            }
            !queue.is_empty()
        });
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Routes inbound packets to registered handlers keyed by command id.
///
/// Replaces the function-pointer command tables of older cluster middleware
/// with boxed closures: payloads reach handlers as typed [`Packet`] values,
/// never through unsafe reinterpretation.
pub struct Dispatcher {
    handlers: HashMap<CommandId, Handler>,
    waitlist: PacketWaitlist,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            waitlist: PacketWaitlist::new(WAITLIST_TTL),
        }
    }

    /// Associate `callback` with a user command. Built-in command ids are
    /// reserved and refused.
    pub fn register_handler(
        &mut self,
        command: CommandId,
        target: TargetKind,
        callback: PacketHandler,
    ) -> Result<(), DispatchError> {
        if command < USER_COMMAND_START {
            return Err(DispatchError::ReservedCommand {
                command,
                start: USER_COMMAND_START,
            });
        }
        if self.handlers.contains_key(&command) {
            return Err(DispatchError::DuplicateHandler { command });
        }
        self.handlers.insert(
            command,
            Handler {
                target,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Ok(())
    }

    /// Validate one packet against the handler table and hand back the
    /// callback to invoke. `object_exists` consults the live object registry
    /// for object-targeted commands; a miss parks the packet for retry.
    ///
    /// Callers invoke the returned handler after releasing their dispatcher
    /// lock, so a handler may call back into registration paths.
    pub fn resolve(
        &mut self,
        from: NodeId,
        packet: Packet,
        object_exists: &dyn Fn(ObjectId) -> bool,
    ) -> Result<(HandlerRef, Packet), DispatchError> {
        let command = packet.command();
        let Some(handler) = self.handlers.get(&command) else {
            return Err(DispatchError::UnknownCommand { command });
        };

        let addressed = if packet.is_object_targeted() {
            TargetKind::Object
        } else {
            TargetKind::Session
        };
        if handler.target != addressed {
            return Err(DispatchError::TargetMismatch {
                command,
                registered: handler.target.name(),
                addressed: addressed.name(),
            });
        }

        if handler.target == TargetKind::Object && !object_exists(packet.object_id()) {
            let object_id = packet.object_id();
            self.waitlist.park(from, packet);
            return Err(DispatchError::UnknownObject { command, object_id });
        }

        Ok((Arc::clone(&handler.callback), packet))
    }

    /// Route one packet, invoking its handler synchronously on the calling
    /// thread.
    pub fn dispatch(
        &mut self,
        from: NodeId,
        packet: Packet,
        object_exists: &dyn Fn(ObjectId) -> bool,
    ) -> Result<(), DispatchError> {
        let (handler, packet) = self.resolve(from, packet, object_exists)?;
        let mut callback = match handler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (*callback)(from, &packet);
        Ok(())
    }

    /// Re-dispatch packets that were waiting for `object_id` to register.
    pub fn flush_ready(
        &mut self,
        object_id: ObjectId,
        object_exists: &dyn Fn(ObjectId) -> bool,
    ) -> Vec<DispatchError> {
        let mut errors = Vec::new();
        for (node, packet) in self.waitlist.flush_ready(object_id) {
            if let Err(error) = self.dispatch(node, packet, object_exists) {
                errors.push(error);
            }
        }
        errors
    }

    /// Park a packet whose target object the caller found unknown (used for
    /// built-in object commands handled outside the handler table).
    pub fn park(&mut self, from: NodeId, packet: Packet) {
        self.waitlist.park(from, packet);
    }

    /// Packets parked for `object_id`, handed back for external re-delivery.
    pub fn take_parked(&mut self, object_id: ObjectId) -> Vec<(NodeId, Packet)> {
        self.waitlist.flush_ready(object_id)
    }

    pub fn drop_expired(&mut self, now: Instant) -> usize {
        self.waitlist.drop_expired(now)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> PacketHandler {
        let counter = Arc::clone(counter);
        Box::new(move |_node, _packet| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn unknown_command_is_an_error_not_a_panic() {
        let mut dispatcher = Dispatcher::new();
        let result = dispatcher.dispatch(1, Packet::new(99, vec![]), &|_| true);
        assert_eq!(result, Err(DispatchError::UnknownCommand { command: 99 }));
    }

    #[test]
    fn reserved_and_duplicate_registrations_are_refused() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(matches!(
            dispatcher.register_handler(3, TargetKind::Session, counting_handler(&counter)),
            Err(DispatchError::ReservedCommand { .. })
        ));

        dispatcher
            .register_handler(70, TargetKind::Session, counting_handler(&counter))
            .unwrap();
        assert!(matches!(
            dispatcher.register_handler(70, TargetKind::Session, counting_handler(&counter)),
            Err(DispatchError::DuplicateHandler { command: 70 })
        ));
    }

    #[test]
    fn session_handler_receives_packet() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register_handler(70, TargetKind::Session, counting_handler(&counter))
            .unwrap();

        dispatcher
            .dispatch(1, Packet::new(70, vec![1, 2]), &|_| false)
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolved_handler_runs_after_the_dispatcher_is_released() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register_handler(70, TargetKind::Session, counting_handler(&counter))
            .unwrap();

        let (handler, packet) = dispatcher
            .resolve(1, Packet::new(70, vec![]), &|_| true)
            .unwrap();
        drop(dispatcher);

        (*handler.lock().unwrap())(1, &packet);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn target_mismatch_is_refused() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register_handler(70, TargetKind::Object, counting_handler(&counter))
            .unwrap();

        let result = dispatcher.dispatch(1, Packet::new(70, vec![]), &|_| true);
        assert!(matches!(result, Err(DispatchError::TargetMismatch { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_object_parks_then_flushes_on_registration() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register_handler(70, TargetKind::Object, counting_handler(&counter))
            .unwrap();

        let result = dispatcher.dispatch(1, Packet::to_object(70, 5, vec![]), &|_| false);
        assert_eq!(
            result,
            Err(DispatchError::UnknownObject {
                command: 70,
                object_id: 5
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Object 5 registers; the parked packet is re-delivered.
        let errors = dispatcher.flush_ready(5, &|id| id == 5);
        assert!(errors.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_parked_packets_are_dropped() {
        let mut waitlist = PacketWaitlist::new(Duration::from_millis(0));
        waitlist.park(1, Packet::to_object(70, 5, vec![]));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(waitlist.drop_expired(Instant::now()), 1);
        assert!(waitlist.is_empty());
        assert!(waitlist.flush_ready(5).is_empty());
    }

    #[test]
    fn waitlist_cap_drops_oldest() {
        let mut waitlist = PacketWaitlist::new(Duration::from_secs(60));
        for i in 0..(WAITLIST_CAP + 1) {
            waitlist.park(1, Packet::to_object(70, 5, vec![i as u8]));
        }
        let flushed = waitlist.flush_ready(5);
        assert_eq!(flushed.len(), WAITLIST_CAP);
        // The oldest packet (payload [0]) was dropped.
        assert_eq!(flushed[0].1.payload(), &[1]);
    }
}
