
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{DirtyMask, ObjectError, ObjectRef, VersionedObject};

pub const FIELD_NEAR: u8 = 0;
pub const FIELD_FAR: u8 = 1;

/// Minimal view-frustum-like fixture: two fields, one dirty bit each.
///
/// Delta layout: `mask: u8 | dirty fields in index order (u32 LE each)`.
/// Full layout: `near: u32 | far: u32`.
pub struct TestFrustum {
    pub near: u32,
    pub far: u32,
    mask: DirtyMask,
}

impl TestFrustum {
    pub fn new(near: u32, far: u32) -> Self {
        Self {
            near,
            far,
            mask: DirtyMask::new(2),
        }
    }

    pub fn shared(near: u32, far: u32) -> (Arc<Mutex<TestFrustum>>, ObjectRef) {
        let concrete = Arc::new(Mutex::new(Self::new(near, far)));
        let object: ObjectRef = concrete.clone();
        (concrete, object)
    }

    pub fn set_near(&mut self, near: u32) {
        self.near = near;
        self.mask.set_bit(FIELD_NEAR, true);
    }

    pub fn set_far(&mut self, far: u32) {
        self.far = far;
        self.mask.set_bit(FIELD_FAR, true);
    }
}

impl VersionedObject for TestFrustum {
    fn dirty_mask(&self) -> &DirtyMask {
        &self.mask
    }

    fn clear_dirty(&mut self) {
        self.mask.clear();
    }

    fn serialize_delta(&self) -> Vec<u8> {
        let mut delta = Vec::new();
        delta.extend_from_slice(self.mask.as_bytes());
        if self.mask.bit(FIELD_NEAR) {
            let _ = delta.write_u32::<LittleEndian>(self.near);
        }
        if self.mask.bit(FIELD_FAR) {
            let _ = delta.write_u32::<LittleEndian>(self.far);
        }
        delta
    }

    fn serialize_full(&self) -> Vec<u8> {
        let mut full = Vec::new();
        let _ = full.write_u32::<LittleEndian>(self.near);
        let _ = full.write_u32::<LittleEndian>(self.far);
        full
    }

    fn apply_delta(&mut self, payload: &[u8]) -> Result<(), ObjectError> {
        let malformed = |reason| ObjectError::MalformedPayload { object: 0, reason };
        let mask = DirtyMask::from_bytes(2, payload)
            .ok_or_else(|| malformed("missing mask record"))?;
        let mut cursor = &payload[DirtyMask::byte_len(2)..];
        if mask.bit(FIELD_NEAR) {
            self.near = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed("truncated near field"))?;
        }
        if mask.bit(FIELD_FAR) {
            self.far = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed("truncated far field"))?;
        }
        Ok(())
    }

    fn apply_full(&mut self, payload: &[u8]) -> Result<(), ObjectError> {
        let malformed = |reason| ObjectError::MalformedPayload { object: 0, reason };
        let mut cursor = payload;
        self.near = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated near field"))?;
        self.far = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated far field"))?;
        Ok(())
    }
}
