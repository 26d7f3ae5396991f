use thiserror::Error;

use crate::types::{ObjectId, Version};

/// Errors that can occur in the versioned object registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    /// An object with this id is already registered in the session.
    #[error("Object {object} is already registered")]
    DuplicateObject { object: ObjectId },

    /// No object with this id is registered.
    #[error("Object {object} is not registered")]
    UnknownObject { object: ObjectId },

    /// Only the authority for an object may commit or snapshot it.
    #[error("This node is not the authority for object {object}")]
    NotAuthority { object: ObjectId },

    /// Commits and snapshots are only applied on subscriber-side objects.
    #[error("This node is the authority for object {object}, refusing inbound update")]
    NotSubscriber { object: ObjectId },

    /// The version counter reached its maximum. Wraparound within a session
    /// is a fatal condition, never silently handled.
    #[error("Version counter exhausted for object {object} at version {version}")]
    VersionExhausted { object: ObjectId, version: Version },

    /// A delta or snapshot payload did not decode against the object's
    /// field layout.
    #[error("Malformed payload for object {object}: {reason}")]
    MalformedPayload {
        object: ObjectId,
        reason: &'static str,
    },
}
