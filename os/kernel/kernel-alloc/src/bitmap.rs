use alloc::vec;
use alloc::vec::Vec;

/// Fixed-length bit set over `u64` words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    num_bits: usize,
    words: Vec<u64>,
}

impl Bitmap {
    /// A bitmap of `num_bits` bits, all clear.
    #[must_use]
    pub fn new(num_bits: usize) -> Self {
        Self {
            num_bits,
            words: vec![0; Self::num_words(num_bits)],
        }
    }

    #[inline]
    #[must_use]
    pub const fn num_words(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    #[cfg(test)]
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.num_bits
    }

    #[cfg(test)]
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Index of the word holding `bit` and the mask selecting it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (bit / u64::BITS as usize, 1 << (bit % u64::BITS as usize))
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits, "bit {index} out of range");
        let (word, mask) = Self::index_and_mask(index);
        self.words[word] & mask != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits, "bit {index} out of range");
        let (word, mask) = Self::index_and_mask(index);
        if value {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
    }

    /// Flip the bit and return its new value.
    #[inline]
    pub fn toggle(&mut self, index: usize) -> bool {
        assert!(index < self.num_bits, "bit {index} out of range");
        let (word, mask) = Self::index_and_mask(index);
        self.words[word] ^= mask;
        self.words[word] & mask != 0
    }

    #[cfg(test)]
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
