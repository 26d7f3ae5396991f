//! # Framelock
//! Session-layer middleware for clusters of cooperating processes: reliable
//! framed messaging over pluggable transports, peer lifecycle management and
//! versioned distributed objects with strict update ordering.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

pub mod compression;
pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod node;
pub mod object;
pub mod packet;
pub mod queue;
pub mod session;
pub mod types;

pub use compression::{CompressionConfig, CompressionMode};
pub use connection::{
    Connection, ConnectionError, ConnectionRef, ConnectionSet, ProbeResult, ReadProbe, Readiness,
    SelectResult, TcpConnection, TcpConnectionListener, TransportKind,
};
pub use dispatch::{DispatchError, Dispatcher, PacketHandler, TargetKind};
pub use node::{Node, NodeDescriptor, NodeError, NodeState};
pub use object::{
    ApplyOutcome, DirtyMask, ObjectError, ObjectHandle, ObjectRef, ObjectRegistry, Role,
    VersionedObject,
};
pub use packet::{Packet, ProtocolError, ReadPacketError, USER_COMMAND_START};
pub use queue::BlockingQueue;
pub use session::{
    NodeLauncher, Session, SessionConfig, SessionError, SessionEvent,
};
pub use types::{CommandId, NodeId, ObjectId, SessionId, Version, NO_OBJECT};

cfg_if! {
    if #[cfg(unix)] {
        pub use connection::{PipeConnection, PipeConnectionListener};
    }
}
