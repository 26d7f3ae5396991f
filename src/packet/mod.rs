pub mod error;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    connection::{read_exact_from, Connection, ConnectionError},
    constants::MAX_PACKET_SIZE,
    types::{CommandId, ObjectId, NO_OBJECT},
};

pub use error::ProtocolError;

/// Built-in command ids. Application commands start at
/// [`USER_COMMAND_START`]; everything below is reserved for the session
/// protocol itself.
pub const CMD_HANDSHAKE: CommandId = 1;
pub const CMD_HANDSHAKE_ACK: CommandId = 2;
pub const CMD_NODE_STOP: CommandId = 3;
pub const CMD_OBJECT_COMMIT: CommandId = 4;
pub const CMD_OBJECT_SNAPSHOT: CommandId = 5;
pub const CMD_OBJECT_RESYNC: CommandId = 6;

/// First command id available to the application.
pub const USER_COMMAND_START: CommandId = 64;

/// Top bit of the command word on the wire: set when the payload is
/// compressed. Never part of a command id.
pub const COMPRESSED_FLAG: u16 = 0x8000;

/// Bytes following the length field that belong to the fixed header:
/// command (u16) + target object id (u64).
pub const HEADER_SIZE: u32 = 2 + 8;

/// One discrete message on the wire. Immutable once constructed; packets are
/// values, not shared mutable state.
///
/// Wire layout, little-endian:
/// `length: u32 | command: u16 | target_object_id: u64 | payload`, where
/// `length` counts every byte after the length field itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    command: CommandId,
    object_id: ObjectId,
    payload: Vec<u8>,
}

impl Packet {
    /// A session-level packet (no target object).
    pub fn new(command: CommandId, payload: Vec<u8>) -> Self {
        Self::to_object(command, NO_OBJECT, payload)
    }

    /// A packet targeting a distributed object.
    pub fn to_object(command: CommandId, object_id: ObjectId, payload: Vec<u8>) -> Self {
        debug_assert_eq!(command & COMPRESSED_FLAG, 0, "command id uses reserved bit");
        Self {
            command,
            object_id,
            payload,
        }
    }

    pub fn command(&self) -> CommandId {
        self.command
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// True when the packet targets a distributed object rather than the
    /// session itself.
    pub fn is_object_targeted(&self) -> bool {
        self.object_id != NO_OBJECT
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Encode into framed wire bytes. `compressed` sets the payload tag bit;
    /// the payload must already be compressed by the caller in that case.
    pub fn to_wire(&self, compressed: bool) -> Vec<u8> {
        let length = HEADER_SIZE + self.payload.len() as u32;
        let mut wire = Vec::with_capacity(4 + length as usize);
        let command_word = if compressed {
            self.command | COMPRESSED_FLAG
        } else {
            self.command
        };
        // These writes cannot fail on a Vec.
        let _ = wire.write_u32::<LittleEndian>(length);
        let _ = wire.write_u16::<LittleEndian>(command_word);
        let _ = wire.write_u64::<LittleEndian>(self.object_id);
        wire.extend_from_slice(&self.payload);
        wire
    }
}

/// A framed packet as read off a connection, before payload decompression.
#[derive(Debug)]
pub struct WirePacket {
    pub packet: Packet,
    pub compressed: bool,
}

/// Read one framed packet from a connection, blocking until complete.
///
/// Framing is a pure byte-count problem: the fixed-size length field is read
/// first, then exactly that many further bytes, independent of payload
/// structure.
pub fn read_packet(connection: &dyn Connection) -> Result<WirePacket, ReadPacketError> {
    let mut length_bytes = [0u8; 4];
    read_exact_from(connection, &mut length_bytes)?;
    let length = (&length_bytes[..])
        .read_u32::<LittleEndian>()
        .unwrap_or_default();

    if length < HEADER_SIZE {
        return Err(ProtocolError::UndersizedPacket {
            length,
            header: HEADER_SIZE,
        }
        .into());
    }
    if length > MAX_PACKET_SIZE {
        return Err(ProtocolError::OversizedPacket {
            length,
            max: MAX_PACKET_SIZE,
        }
        .into());
    }

    let mut body = vec![0u8; length as usize];
    read_exact_from(connection, &mut body)?;

    let mut cursor = &body[..];
    let command_word = cursor.read_u16::<LittleEndian>().unwrap_or_default();
    let object_id = cursor.read_u64::<LittleEndian>().unwrap_or_default();
    let payload = cursor.to_vec();

    let compressed = command_word & COMPRESSED_FLAG != 0;
    let command = command_word & !COMPRESSED_FLAG;

    Ok(WirePacket {
        packet: Packet {
            command,
            object_id,
            payload,
        },
        compressed,
    })
}

/// Why a framed read failed: the connection died, or the stream carried a
/// malformed frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadPacketError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
