//! End-to-end exercises of two sessions linked by a local pipe pair:
//! handshake, application packets, object subscription and commit fan-out.

#![cfg(unix)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use framelock::{
    ConnectionRef, DirtyMask, NodeDescriptor, NodeState, ObjectError, ObjectRef, PipeConnection,
    Role, Session, SessionConfig, TargetKind, VersionedObject, USER_COMMAND_START,
};

const FIELD_EYE: u8 = 0;
const FIELD_FOCUS: u8 = 1;

/// Two-field camera-like state with one dirty bit per field.
///
/// Delta layout: `mask: u8 | dirty fields in index order (u32 LE each)`.
/// Full layout: `eye: u32 | focus: u32`.
struct ViewState {
    eye: u32,
    focus: u32,
    mask: DirtyMask,
}

impl ViewState {
    fn new(eye: u32, focus: u32) -> Self {
        Self {
            eye,
            focus,
            mask: DirtyMask::new(2),
        }
    }

    fn shared(eye: u32, focus: u32) -> (Arc<Mutex<ViewState>>, ObjectRef) {
        let concrete = Arc::new(Mutex::new(Self::new(eye, focus)));
        let object: ObjectRef = concrete.clone();
        (concrete, object)
    }

    fn set_eye(&mut self, eye: u32) {
        self.eye = eye;
        self.mask.set_bit(FIELD_EYE, true);
    }

    fn set_focus(&mut self, focus: u32) {
        self.focus = focus;
        self.mask.set_bit(FIELD_FOCUS, true);
    }
}

impl VersionedObject for ViewState {
    fn dirty_mask(&self) -> &DirtyMask {
        &self.mask
    }

    fn clear_dirty(&mut self) {
        self.mask.clear();
    }

    fn serialize_delta(&self) -> Vec<u8> {
        let mut delta = Vec::new();
        delta.extend_from_slice(self.mask.as_bytes());
        if self.mask.bit(FIELD_EYE) {
            let _ = delta.write_u32::<LittleEndian>(self.eye);
        }
        if self.mask.bit(FIELD_FOCUS) {
            let _ = delta.write_u32::<LittleEndian>(self.focus);
        }
        delta
    }

    fn serialize_full(&self) -> Vec<u8> {
        let mut full = Vec::new();
        let _ = full.write_u32::<LittleEndian>(self.eye);
        let _ = full.write_u32::<LittleEndian>(self.focus);
        full
    }

    fn apply_delta(&mut self, payload: &[u8]) -> Result<(), ObjectError> {
        let malformed = |reason| ObjectError::MalformedPayload { object: 0, reason };
        let mask =
            DirtyMask::from_bytes(2, payload).ok_or_else(|| malformed("missing mask record"))?;
        let mut cursor = &payload[DirtyMask::byte_len(2)..];
        if mask.bit(FIELD_EYE) {
            self.eye = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed("truncated eye field"))?;
        }
        if mask.bit(FIELD_FOCUS) {
            self.focus = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed("truncated focus field"))?;
        }
        Ok(())
    }

    fn apply_full(&mut self, payload: &[u8]) -> Result<(), ObjectError> {
        let malformed = |reason| ObjectError::MalformedPayload { object: 0, reason };
        let mut cursor = payload;
        self.eye = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated eye field"))?;
        self.focus = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated focus field"))?;
        Ok(())
    }
}

fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        host: "localhost".to_string(),
        launch_command: None,
    }
}

/// Two sessions, node 1 and node 2, linked by a pipe pair and handshaken.
fn linked_sessions() -> (Session, Session) {
    let a = Session::new(1, SessionConfig::default(), None);
    let b = Session::new(2, SessionConfig::default(), None);

    let (conn_a, conn_b) = PipeConnection::pair().unwrap();
    a.add_node(2, descriptor()).unwrap();
    a.init_node(2, descriptor()).unwrap();
    a.set_started(2, Arc::new(conn_a) as ConnectionRef).unwrap();

    b.add_node(1, descriptor()).unwrap();
    b.init_node(1, descriptor()).unwrap();
    b.set_started(1, Arc::new(conn_b) as ConnectionRef).unwrap();

    assert!(wait_until(&a, || a.node_state(2).unwrap() == NodeState::Running));
    assert!(wait_until(&b, || b.node_state(1).unwrap() == NodeState::Running));
    (a, b)
}

/// Pump the session's process loop until `done` holds or five seconds pass.
fn wait_until(session: &Session, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if done() {
            return true;
        }
        session.process(Duration::from_millis(100));
    }
    done()
}

const VIEW_OBJECT: u64 = 42;

#[test]
fn snapshot_then_commits_propagate_in_order() {
    let (a, b) = linked_sessions();

    let (authority, authority_ref) = ViewState::shared(10, 100);
    let handle_a = a
        .register_object(VIEW_OBJECT, authority_ref, Role::Authority)
        .unwrap();

    let (replica, replica_ref) = ViewState::shared(0, 0);
    let handle_b = b
        .register_object(VIEW_OBJECT, replica_ref, Role::Subscriber)
        .unwrap();

    // The new subscriber starts from a full snapshot of the current state.
    a.subscribe(2, handle_a).unwrap();
    assert!(wait_until(&b, || replica.lock().unwrap().eye == 10));
    assert_eq!(replica.lock().unwrap().focus, 100);
    assert_eq!(b.object_version(handle_b).unwrap(), 1);

    // First commit: only the eye field travels.
    authority.lock().unwrap().set_eye(11);
    assert_eq!(a.commit(handle_a).unwrap(), 2);

    // Second commit: both fields.
    {
        let mut state = authority.lock().unwrap();
        state.set_eye(12);
        state.set_focus(120);
    }
    assert_eq!(a.commit(handle_a).unwrap(), 3);

    assert!(wait_until(&b, || b.object_version(handle_b).unwrap() == 3));
    let replica = replica.lock().unwrap();
    assert_eq!(replica.eye, 12);
    assert_eq!(replica.focus, 120);
}

#[test]
fn updates_arriving_before_registration_are_delivered_afterwards() {
    let (a, b) = linked_sessions();

    let (authority, authority_ref) = ViewState::shared(7, 70);
    let handle_a = a
        .register_object(VIEW_OBJECT, authority_ref, Role::Authority)
        .unwrap();

    // Subscribe and commit before the peer has registered its replica.
    a.subscribe(2, handle_a).unwrap();
    authority.lock().unwrap().set_focus(71);
    assert_eq!(a.commit(handle_a).unwrap(), 2);

    // The peer parks both packets against the unknown object id.
    b.process(Duration::from_secs(1));

    let (replica, replica_ref) = ViewState::shared(0, 0);
    let handle_b = b
        .register_object(VIEW_OBJECT, replica_ref, Role::Subscriber)
        .unwrap();

    assert!(wait_until(&b, || b.object_version(handle_b).unwrap() == 2));
    let replica = replica.lock().unwrap();
    assert_eq!(replica.eye, 7);
    assert_eq!(replica.focus, 71);
}

#[test]
fn application_packets_round_trip() {
    let (a, b) = linked_sessions();
    const PING: u16 = USER_COMMAND_START;
    const PONG: u16 = USER_COMMAND_START + 1;

    let pongs = Arc::new(AtomicUsize::new(0));
    let pongs_in_handler = Arc::clone(&pongs);
    a.on_packet(
        PONG,
        TargetKind::Session,
        Box::new(move |from, packet| {
            assert_eq!(from, 2);
            assert_eq!(packet.payload(), b"frame-ready");
            pongs_in_handler.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let pings = Arc::new(AtomicUsize::new(0));
    let pings_in_handler = Arc::clone(&pings);
    b.on_packet(
        PING,
        TargetKind::Session,
        Box::new(move |from, packet| {
            assert_eq!(from, 1);
            assert_eq!(packet.payload(), b"start-frame");
            pings_in_handler.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    a.send_packet(2, PING, b"start-frame".to_vec()).unwrap();
    assert!(wait_until(&b, || pings.load(Ordering::SeqCst) == 1));

    b.send_packet(1, PONG, b"frame-ready".to_vec()).unwrap();
    assert!(wait_until(&a, || pongs.load(Ordering::SeqCst) == 1));
}

#[test]
fn peer_stop_surfaces_as_state_change() {
    let (a, b) = linked_sessions();

    a.stop_node(2).unwrap();
    assert_eq!(a.node_state(2).unwrap(), NodeState::Stopped);

    assert!(wait_until(&b, || b.node_state(1).unwrap()
        == NodeState::Stopped));
}
