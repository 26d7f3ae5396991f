use thiserror::Error;

use crate::types::{CommandId, ObjectId};

/// Errors raised while framing or interpreting packets.
///
/// Protocol errors are per-packet: they are logged, the packet is dropped and
/// the connection stays open (peers with a newer protocol may legitimately
/// send commands this process does not know).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The length field exceeds the configured packet size cap. This usually
    /// means a desynchronized or corrupted stream.
    #[error("Packet length {length} exceeds maximum of {max} bytes")]
    OversizedPacket { length: u32, max: u32 },

    /// The length field is smaller than the fixed header.
    #[error("Packet length {length} is smaller than the {header} byte header")]
    UndersizedPacket { length: u32, header: u32 },

    /// A command payload did not decode to its expected shape.
    #[error("Malformed payload for command {command} on object {object_id}: {reason}")]
    MalformedPayload {
        command: CommandId,
        object_id: ObjectId,
        reason: &'static str,
    },

    /// A compressed payload arrived but no decompression capability is
    /// available (peer negotiated nothing, or the feature is compiled out).
    #[error("Compressed payload for command {command} but compression is unavailable")]
    CompressionUnavailable { command: CommandId },
}
