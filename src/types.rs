/// Stable identifier of one peer process within a session.
pub type NodeId = u64;

/// Stable identifier of one distributed object. `0` is reserved to mean
/// "session-level, no object" in packet headers.
pub type ObjectId = u64;

/// Command/type tag of a packet. The top bit is reserved for the
/// compressed-payload flag and is never part of a command id.
pub type CommandId = u16;

/// Version counter of a distributed object. Starts at 1, strictly increases,
/// never wraps within a session.
pub type Version = u64;

/// Identifier of one distributed session.
pub type SessionId = u64;

/// Object id used in packet headers for session-level commands.
pub const NO_OBJECT: ObjectId = 0;
