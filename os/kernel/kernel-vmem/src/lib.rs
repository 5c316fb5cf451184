//! # Page Table Manager
//!
//! Builds x86-64 four-level address translation trees.
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L3   |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! Every level is a [`PageTable`] of 512 eight-byte [`PageTableEntry`]s. An
//! entry at level 0 maps 4 KiB, at level 1 it covers 2 MiB, at level 2 1 GiB,
//! at level 3 512 GiB. The root table's physical address identifies an
//! [`AddressSpace`].
//!
//! Tables are created lazily: the first mapping that needs to walk through a
//! missing table allocates one from a [`TableAlloc`] and zeroes it. Tables are
//! reached through a [`PhysMapper`], which turns their physical address into
//! a usable reference (identity map during early boot, HHDM afterwards).
//! Mappings are only ever added.
//!
//! No locking happens here. Callers serialize `map_range` per address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_table;
mod page_table_entry;

pub use crate::address_space::{AddressSpace, MapError, MappingFlags};
pub use crate::page_table::{ENTRIES, LEVELS, PageTable, entry_window, level_shift};
pub use crate::page_table_entry::PageTableEntry;
use kernel_memory_addresses::PhysicalAddress;

/// Turns a physical address into a usable reference.
pub trait PhysMapper {
    /// # Safety
    /// `pa` must be mapped in the current address space, suitably aligned
    /// for `T`, and hold a valid `T`. The caller must not create aliasing
    /// mutable references.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Storage for new page tables.
pub trait TableAlloc {
    /// A 4 KiB-aligned physical page for a new table, or `None` when exhausted.
    ///
    /// The contents need not be zeroed.
    fn alloc_table(&mut self) -> Option<PhysicalAddress>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{PhysMapper, TableAlloc};
    use core::cell::UnsafeCell;
    use kernel_memory_addresses::PhysicalAddress;

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    pub struct BumpAlloc {
        /// Next free physical byte address (must remain 4 KiB aligned)
        next: u64,
        /// Exclusive end (bounds check)
        end: u64,
        pub allocated: usize,
    }

    impl BumpAlloc {
        pub const fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                allocated: 0,
            }
        }
    }

    impl TableAlloc for BumpAlloc {
        fn alloc_table(&mut self) -> Option<PhysicalAddress> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            self.allocated += 1;
            Some(PhysicalAddress::new(p))
        }
    }

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// In-memory "RAM" where physical addresses are byte offsets from 0.
    ///
    /// Frames are filled with `0xAA` so that tests notice tables that were not
    /// zeroed after allocation.
    pub struct TestPhys {
        frames: Vec<UnsafeCell<Aligned4K>>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n)
                    .map(|_| UnsafeCell::new(Aligned4K([0xAA; 4096])))
                    .collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
            let off = usize::try_from(pa.as_u64() & 0xfff).unwrap();
            // For page tables we expect offset==0; assert to catch misuse in the test.
            assert_eq!(off, 0);
            unsafe { &mut *self.frames[idx].get().cast::<T>() }
        }
    }
}
