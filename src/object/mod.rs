pub mod dirty_mask;
pub mod error;
pub mod registry;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};

pub use dirty_mask::DirtyMask;
pub use error::ObjectError;
pub use registry::{ApplyOutcome, CommitOutgoing, ObjectRegistry, Role, SnapshotOutgoing};

/// One piece of application state shared across nodes.
///
/// Implementors track their own [`DirtyMask`] (setters mark the bit of the
/// field they touch) and define the delta and full-state encodings. The
/// registry drives versioning, fan-out and ordering around them.
pub trait VersionedObject: Send {
    /// Which fields changed since the last committed version.
    fn dirty_mask(&self) -> &DirtyMask;

    /// Reset the dirty mask after a commit serialized it.
    fn clear_dirty(&mut self);

    /// Encode exactly the dirty fields, including the mask record itself, so
    /// the delta is self-describing.
    fn serialize_delta(&self) -> Vec<u8>;

    /// Encode the complete state, for snapshots and resynchronization.
    fn serialize_full(&self) -> Vec<u8>;

    /// Mutate only the fields named by the delta's own mask record.
    fn apply_delta(&mut self, payload: &[u8]) -> Result<(), ObjectError>;

    /// Replace the complete state.
    fn apply_full(&mut self, payload: &[u8]) -> Result<(), ObjectError>;
}

/// Shared handle to a registered object. The application keeps its own
/// (concrete) clone of the `Arc` and mutates the object through it; the
/// registry locks it only for serialize/apply.
pub type ObjectRef = Arc<Mutex<dyn VersionedObject>>;

/// Opaque handle returned by object registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub(crate) crate::types::ObjectId);

impl ObjectHandle {
    pub fn id(&self) -> crate::types::ObjectId {
        self.0
    }
}
