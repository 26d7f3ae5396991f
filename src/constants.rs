use std::time::Duration;

/// Wire protocol version exchanged in the handshake. Peers with a different
/// version are refused during connection setup.
pub const PROTOCOL_VERSION: u16 = 3;

/// Upper bound on the framed size of a single packet (bytes following the
/// length field). Anything larger is treated as a malformed stream.
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024; // 16 MB

/// How many out-of-order commit versions a subscriber buffers per object
/// before giving up on retransmission and requesting a full snapshot.
pub const COMMIT_BUFFER_LIMIT: usize = 16;

/// Retry window for packets targeting an object id that is not registered
/// yet. Models new-object-registration races; after this the packet is
/// dropped with an error.
pub const WAITLIST_TTL: Duration = Duration::from_secs(10);

/// Interval at which connection watchers re-check their stop flag while
/// waiting for readiness.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on the session's inbound packet queue. Reader threads block once it
/// is full, so a stalled application thread backpressures the transports
/// instead of growing the queue without limit.
pub const INBOUND_QUEUE_LIMIT: usize = 1024;
