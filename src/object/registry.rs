use std::collections::{BTreeMap, HashMap, HashSet};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;

use crate::{
    constants::COMMIT_BUFFER_LIMIT,
    types::{NodeId, ObjectId, Version},
};

use super::{ObjectError, ObjectHandle, ObjectRef};

/// Whether the local node is the authority for an object or a subscriber
/// following it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Authority,
    Subscriber,
}

/// A commit ready to fan out to subscribers.
#[derive(Debug)]
pub struct CommitOutgoing {
    pub object_id: ObjectId,
    pub version: Version,
    pub payload: Vec<u8>,
    pub subscribers: Vec<NodeId>,
}

/// A full-state snapshot ready to send to one node.
#[derive(Debug)]
pub struct SnapshotOutgoing {
    pub object_id: ObjectId,
    pub version: Version,
    pub payload: Vec<u8>,
}

/// Result of applying an inbound commit or snapshot on a subscriber.
#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied in order; the local version advanced to the contained value
    /// (buffered successors may have been drained too).
    Applied { version: Version },
    /// The update was at or below the local version; ignored.
    Duplicate,
    /// Out of order and buffered; a resync request is already outstanding.
    Buffered,
    /// Out of order; the caller must request a full resynchronization from
    /// the upstream node. Local state was not mutated.
    NeedResync { expected: Version, received: Version },
}

struct Entry {
    object: ObjectRef,
    version: Version,
    role: Role,
    subscribers: HashSet<NodeId>,
    /// Node the latest inbound update came from; resync requests go there.
    upstream: Option<NodeId>,
    /// Out-of-order commit deltas held until the gap closes or a snapshot
    /// replaces them.
    pending: BTreeMap<Version, Vec<u8>>,
    resync_requested: bool,
}

/// Per-session registry of versioned distributed objects.
///
/// Maintains each object's current version, its serialize/apply routines and
/// its subscriber fan-out. The ordering contract is enforced here: no
/// subscriber-side object ever observes version N+1 before version N.
pub struct ObjectRegistry {
    objects: HashMap<ObjectId, Entry>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }

    /// Register an object under a stable, session-unique id. Versions start
    /// at 1.
    pub fn register(
        &mut self,
        id: ObjectId,
        object: ObjectRef,
        role: Role,
    ) -> Result<ObjectHandle, ObjectError> {
        if self.objects.contains_key(&id) {
            return Err(ObjectError::DuplicateObject { object: id });
        }
        self.objects.insert(
            id,
            Entry {
                object,
                version: 1,
                role,
                subscribers: HashSet::new(),
                upstream: None,
                pending: BTreeMap::new(),
                resync_requested: false,
            },
        );
        Ok(ObjectHandle(id))
    }

    pub fn deregister(&mut self, id: ObjectId) -> Result<(), ObjectError> {
        self.objects
            .remove(&id)
            .map(|_| ())
            .ok_or(ObjectError::UnknownObject { object: id })
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn version(&self, id: ObjectId) -> Result<Version, ObjectError> {
        Ok(self.entry(id)?.version)
    }

    pub fn role(&self, id: ObjectId) -> Result<Role, ObjectError> {
        Ok(self.entry(id)?.role)
    }

    pub fn upstream(&self, id: ObjectId) -> Result<Option<NodeId>, ObjectError> {
        Ok(self.entry(id)?.upstream)
    }

    /// Commit the object's dirty fields, assigning the next version.
    ///
    /// Idempotent when nothing is dirty (`Ok(None)`). The local version
    /// advances immediately and synchronously; acknowledgments are never
    /// awaited.
    pub fn commit(&mut self, handle: ObjectHandle) -> Result<Option<CommitOutgoing>, ObjectError> {
        let id = handle.0;
        let entry = self.entry_mut(id)?;
        if entry.role != Role::Authority {
            return Err(ObjectError::NotAuthority { object: id });
        }

        let mut object = lock_object(&entry.object);
        if object.dirty_mask().is_clear() {
            return Ok(None);
        }

        let version = entry
            .version
            .checked_add(1)
            .ok_or(ObjectError::VersionExhausted {
                object: id,
                version: entry.version,
            })?;

        let delta = object.serialize_delta();
        object.clear_dirty();
        drop(object);

        entry.version = version;
        Ok(Some(CommitOutgoing {
            object_id: id,
            version,
            payload: encode_versioned_payload(version, &delta),
            subscribers: entry.subscribers.iter().copied().collect(),
        }))
    }

    /// Serialize the authority's full state, tagged with the current version.
    pub fn snapshot(&self, id: ObjectId) -> Result<SnapshotOutgoing, ObjectError> {
        let entry = self.entry(id)?;
        if entry.role != Role::Authority {
            return Err(ObjectError::NotAuthority { object: id });
        }
        let object = lock_object(&entry.object);
        let full = object.serialize_full();
        Ok(SnapshotOutgoing {
            object_id: id,
            version: entry.version,
            payload: encode_versioned_payload(entry.version, &full),
        })
    }

    /// Add a node to the object's fan-out. Returns the snapshot that must be
    /// sent immediately so the new subscriber starts from a consistent state
    /// rather than replaying history.
    pub fn subscribe(
        &mut self,
        node: NodeId,
        handle: ObjectHandle,
    ) -> Result<SnapshotOutgoing, ObjectError> {
        let id = handle.0;
        {
            let entry = self.entry_mut(id)?;
            if entry.role != Role::Authority {
                return Err(ObjectError::NotAuthority { object: id });
            }
            entry.subscribers.insert(node);
        }
        self.snapshot(id)
    }

    pub fn unsubscribe(&mut self, node: NodeId, handle: ObjectHandle) -> Result<(), ObjectError> {
        self.entry_mut(handle.0)?.subscribers.remove(&node);
        Ok(())
    }

    /// Remove a stopped node from every fan-out list. Its subscription state
    /// is discarded; a future restart is fully resynchronized, never diffed.
    pub fn unsubscribe_node(&mut self, node: NodeId) {
        for entry in self.objects.values_mut() {
            entry.subscribers.remove(&node);
        }
    }

    /// Apply an inbound commit on a subscriber-side object.
    ///
    /// Ordering is enforced strictly: only `local version + 1` is applied.
    /// Anything newer is buffered (bounded) and answered with a resync
    /// request; local state is never mutated out of order.
    pub fn apply_commit(
        &mut self,
        id: ObjectId,
        from: NodeId,
        payload: &[u8],
    ) -> Result<ApplyOutcome, ObjectError> {
        let entry = self.entry_mut(id)?;
        if entry.role != Role::Subscriber {
            return Err(ObjectError::NotSubscriber { object: id });
        }
        entry.upstream = Some(from);

        let (version, delta) = decode_versioned_payload(id, payload)?;

        if version <= entry.version {
            warn!(
                "object {id}: duplicate commit version {version} (local {}), ignoring",
                entry.version
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        let expected = entry
            .version
            .checked_add(1)
            .ok_or(ObjectError::VersionExhausted {
                object: id,
                version: entry.version,
            })?;

        if version > expected {
            if entry.pending.len() >= COMMIT_BUFFER_LIMIT {
                // Give up on retransmission; a snapshot will replace state.
                entry.pending.clear();
            }
            entry.pending.insert(version, delta.to_vec());
            if entry.resync_requested {
                return Ok(ApplyOutcome::Buffered);
            }
            entry.resync_requested = true;
            warn!(
                "object {id}: commit version {version} arrived before {expected}, requesting resync"
            );
            return Ok(ApplyOutcome::NeedResync {
                expected,
                received: version,
            });
        }

        let mut object = lock_object(&entry.object);
        object.apply_delta(delta)?;
        entry.version = version;

        // Drain buffered successors that are now in order.
        while let Some(buffered) = entry.pending.remove(&(entry.version + 1)) {
            object.apply_delta(&buffered)?;
            entry.version += 1;
        }
        drop(object);
        entry.pending.retain(|&buffered_version, _| buffered_version > entry.version);
        if entry.pending.is_empty() {
            entry.resync_requested = false;
        }

        Ok(ApplyOutcome::Applied {
            version: entry.version,
        })
    }

    /// Apply a full-state snapshot on a subscriber-side object.
    pub fn apply_snapshot(
        &mut self,
        id: ObjectId,
        from: NodeId,
        payload: &[u8],
    ) -> Result<ApplyOutcome, ObjectError> {
        let entry = self.entry_mut(id)?;
        if entry.role != Role::Subscriber {
            return Err(ObjectError::NotSubscriber { object: id });
        }
        entry.upstream = Some(from);

        let (version, full) = decode_versioned_payload(id, payload)?;
        if version < entry.version {
            warn!(
                "object {id}: stale snapshot version {version} (local {}), ignoring",
                entry.version
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut object = lock_object(&entry.object);
        object.apply_full(full)?;
        entry.version = version;
        entry.resync_requested = false;

        // Buffered commits the snapshot superseded are dropped; any that
        // continue the sequence are drained.
        entry.pending.retain(|&buffered_version, _| buffered_version > version);
        while let Some(buffered) = entry.pending.remove(&(entry.version + 1)) {
            object.apply_delta(&buffered)?;
            entry.version += 1;
        }

        Ok(ApplyOutcome::Applied {
            version: entry.version,
        })
    }

    fn entry(&self, id: ObjectId) -> Result<&Entry, ObjectError> {
        self.objects
            .get(&id)
            .ok_or(ObjectError::UnknownObject { object: id })
    }

    fn entry_mut(&mut self, id: ObjectId) -> Result<&mut Entry, ObjectError> {
        self.objects
            .get_mut(&id)
            .ok_or(ObjectError::UnknownObject { object: id })
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_object(
    object: &ObjectRef,
) -> std::sync::MutexGuard<'_, dyn super::VersionedObject + 'static> {
    match object.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Commit and snapshot payloads carry their version first:
/// `version: u64 | body`.
pub(crate) fn encode_versioned_payload(version: Version, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + body.len());
    let _ = payload.write_u64::<LittleEndian>(version);
    payload.extend_from_slice(body);
    payload
}

pub(crate) fn decode_versioned_payload(
    id: ObjectId,
    payload: &[u8],
) -> Result<(Version, &[u8]), ObjectError> {
    if payload.len() < 8 {
        return Err(ObjectError::MalformedPayload {
            object: id,
            reason: "payload shorter than version field",
        });
    }
    let version = (&payload[..8])
        .read_u64::<LittleEndian>()
        .unwrap_or_default();
    Ok((version, &payload[8..]))
}
