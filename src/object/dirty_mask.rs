/// Records which logical fields of a distributed object changed since the
/// last committed version.
///
/// One bit per field, fixed width per object type. The mask travels inside
/// delta payloads so a subscriber mutates exactly the fields the authority
/// serialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyMask {
    mask: Vec<u8>,
    bits: u8,
}

impl DirtyMask {
    pub fn new(bits: u8) -> Self {
        Self {
            mask: vec![0; Self::byte_len(bits)],
            bits,
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn set_bit(&mut self, index: u8, value: bool) {
        if index >= self.bits {
            return;
        }
        let byte = (index / 8) as usize;
        let bit = 1u8 << (index % 8);
        if value {
            self.mask[byte] |= bit;
        } else {
            self.mask[byte] &= !bit;
        }
    }

    pub fn bit(&self, index: u8) -> bool {
        if index >= self.bits {
            return false;
        }
        self.mask[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    pub fn or(&mut self, other: &DirtyMask) {
        for (byte, other_byte) in self.mask.iter_mut().zip(other.mask.iter()) {
            *byte |= other_byte;
        }
    }

    pub fn clear(&mut self) {
        self.mask.fill(0);
    }

    pub fn is_clear(&self) -> bool {
        self.mask.iter().all(|byte| *byte == 0)
    }

    /// Raw mask bytes, for embedding in a delta payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mask
    }

    /// Rebuild a mask of `bits` width from payload bytes. Returns `None` if
    /// `bytes` is too short.
    pub fn from_bytes(bits: u8, bytes: &[u8]) -> Option<Self> {
        let length = Self::byte_len(bits);
        if bytes.len() < length {
            return None;
        }
        Some(Self {
            mask: bytes[..length].to_vec(),
            bits,
        })
    }

    pub const fn byte_len(bits: u8) -> usize {
        bits.div_ceil(8) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::DirtyMask;

    #[test]
    fn set_clear_and_query() {
        let mut mask = DirtyMask::new(10);
        assert!(mask.is_clear());

        mask.set_bit(0, true);
        mask.set_bit(9, true);
        assert!(mask.bit(0));
        assert!(!mask.bit(1));
        assert!(mask.bit(9));
        assert!(!mask.is_clear());

        mask.set_bit(0, false);
        assert!(!mask.bit(0));

        mask.clear();
        assert!(mask.is_clear());
    }

    #[test]
    fn out_of_range_bits_are_ignored() {
        let mut mask = DirtyMask::new(4);
        mask.set_bit(12, true);
        assert!(mask.is_clear());
        assert!(!mask.bit(12));
    }

    #[test]
    fn or_merges_masks() {
        let mut a = DirtyMask::new(8);
        let mut b = DirtyMask::new(8);
        a.set_bit(1, true);
        b.set_bit(6, true);

        a.or(&b);
        assert!(a.bit(1));
        assert!(a.bit(6));
    }

    #[test]
    fn byte_round_trip() {
        let mut mask = DirtyMask::new(12);
        mask.set_bit(3, true);
        mask.set_bit(11, true);

        let restored = DirtyMask::from_bytes(12, mask.as_bytes()).unwrap();
        assert_eq!(restored, mask);
        assert!(DirtyMask::from_bytes(12, &[0]).is_none());
    }
}
