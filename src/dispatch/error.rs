use thiserror::Error;

use crate::types::{CommandId, ObjectId};

/// Errors that can occur while routing an inbound packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No handler is registered for this command. Non-fatal: logged and the
    /// packet dropped, since protocol versions may legitimately differ.
    #[error("No handler registered for command {command}")]
    UnknownCommand { command: CommandId },

    /// An object-targeted packet arrived for an object id that is not
    /// registered. The packet was parked for a bounded retry window.
    #[error("Command {command} targets unknown object {object_id}, parked for retry")]
    UnknownObject {
        command: CommandId,
        object_id: ObjectId,
    },

    /// A session-level packet arrived for a command registered as
    /// object-targeted, or vice versa.
    #[error("Command {command} target mismatch: registered for {registered}, packet addressed {addressed}")]
    TargetMismatch {
        command: CommandId,
        registered: &'static str,
        addressed: &'static str,
    },

    /// A command id collided with an already registered handler.
    #[error("A handler is already registered for command {command}")]
    DuplicateHandler { command: CommandId },

    /// Attempted to register a handler in the reserved built-in range.
    #[error("Command {command} is reserved for the session protocol (user commands start at {start})")]
    ReservedCommand { command: CommandId, start: CommandId },
}
