//! # Memory Page Table

use crate::PageTableEntry;
use core::ops::{Index, IndexMut};

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// Number of translation levels; level 3 is the root, level 0 the leaf table.
pub const LEVELS: usize = 4;

/// Virtual address bit where each level's index starts.
const LEVEL_SHIFT: [u32; LEVELS] = [12, 21, 30, 39];

/// `log2` of the virtual window covered by one entry at `level`.
///
/// 4 KiB at level 0, 2 MiB at level 1, 1 GiB at level 2, 512 GiB at level 3.
#[inline]
#[must_use]
pub const fn level_shift(level: usize) -> u32 {
    LEVEL_SHIFT[level]
}

/// Bytes covered by one entry at `level`.
#[inline]
#[must_use]
pub const fn entry_window(level: usize) -> u64 {
    1 << LEVEL_SHIFT[level]
}

/// One 4 KiB page worth of entries, used for every level.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES],
        }
    }

    /// Mark every entry not present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}
