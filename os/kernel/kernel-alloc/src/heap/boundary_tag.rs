use bitfield_struct::bitfield;

/// Chunk prefix and suffix word.
///
/// ```text
/// 31                              1   0
/// +-------------------------------+---+
/// |          body size            | O |
/// +-------------------------------+---+
/// ```
///
/// Both tags of a live chunk must hold the same value; a mismatch means the
/// heap was corrupted.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct BoundaryTag {
    /// Set while the chunk is handed out.
    pub occupied: bool,
    /// Body size in bytes, excluding both tags.
    #[bits(31)]
    pub size: u32,
}

impl BoundaryTag {
    #[inline]
    #[must_use]
    pub const fn occupied_with(size: u32) -> Self {
        Self::new().with_occupied(true).with_size(size)
    }

    #[inline]
    #[must_use]
    pub const fn free_with(size: u32) -> Self {
        Self::new().with_occupied(false).with_size(size)
    }

    /// Tag at heap offset 0, left of the first chunk. Keeps left-coalescing
    /// from ever walking off the start of the heap.
    pub const SENTINEL: Self = Self::occupied_with(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_flag_into_bit_zero() {
        let tag = BoundaryTag::occupied_with(24);
        assert_eq!(tag.into_bits(), (24 << 1) | 1);
        assert!(tag.occupied());
        assert_eq!(tag.size(), 24);

        let tag = BoundaryTag::from_bits(48 << 1);
        assert!(!tag.occupied());
        assert_eq!(tag, BoundaryTag::free_with(48));
    }

    #[test]
    fn largest_body_fits() {
        let tag = BoundaryTag::free_with(1 << 30);
        assert_eq!(tag.size(), 1 << 30);
        assert!(!tag.occupied());
    }
}
