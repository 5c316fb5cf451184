//! # Address Space (x86-64, four-level)
//!
//! A handle to one translation tree, identified by the physical address of
//! its root (level-3) table.
//!
//! ## Highlights
//!
//! - [`AddressSpace::create`] allocates and zeroes a fresh root table.
//! - [`AddressSpace::map_range`] maps a virtual range onto a contiguous
//!   physical range with 4 KiB pages, creating intermediate tables on demand.
//! - [`AddressSpace::map_range_with`] does the same with 2 MiB or 1 GiB leaves,
//!   used for the boot-time identity map.
//! - [`AddressSpace::translate`] walks the tree in software.
//! - [`AddressSpace::activate`] loads CR3 through a [`RegisterAccess`] provider.
//!
//! ## Range subdivision
//!
//! A single function handles all levels. At each level it visits every entry
//! whose window intersects the requested range, clamps the range to that
//! window and descends, until it reaches the level whose entries are leaves
//! for the requested page size.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance by the caller.
//! - The [`PhysMapper`] must yield writable references to table frames.

use crate::page_table::{ENTRIES, LEVELS, entry_window, level_shift};
use crate::{PageTable, PageTableEntry, PhysMapper, TableAlloc};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_registers::{Cr3, RegisterAccess};
use log::trace;

/// Recoverable mapping failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The table allocator ran dry while creating a table for `level`.
    #[error("out of memory allocating a level-{level} page table")]
    OutOfMemory { level: usize },
    /// The entry covering `va` at `level` is already a leaf of a different
    /// size, or already links a table where a huge leaf was requested.
    #[error("mapping at {va} conflicts with an existing level-{level} entry")]
    Conflict { va: VirtualAddress, level: usize },
}

/// Leaf permissions.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MappingFlags {
    pub writable: bool,
    pub user: bool,
}

impl MappingFlags {
    pub const KERNEL_RW: Self = Self {
        writable: true,
        user: false,
    };

    pub const USER_RW: Self = Self {
        writable: true,
        user: true,
    };

    #[must_use]
    pub const fn new(writable: bool, user: bool) -> Self {
        Self { writable, user }
    }
}

/// Parameters shared by every recursion step of one `map_range` call.
#[derive(Copy, Clone)]
struct MapRequest {
    /// Last (inclusive) virtual address of the range.
    last: u64,
    /// `pa - va`, modulo 2^64.
    delta: u64,
    leaf_level: usize,
    flags: MappingFlags,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a new root table.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if `alloc` has no page left.
    pub fn create<A: TableAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = Self::new_table(mapper, alloc, LEVELS - 1)?;
        Ok(Self { root, mapper })
    }

    /// Wrap an existing root table.
    ///
    /// # Panics
    /// If `root` is not 4 KiB-aligned.
    #[inline]
    pub fn from_root(mapper: &'m M, root: PhysicalAddress) -> Self {
        assert!(root.is_aligned::<Size4K>(), "misaligned root table {root}");
        Self { root, mapper }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// Paging must be enabled and CR3 must point at a valid root table that
    /// `mapper` can reach.
    #[inline]
    pub unsafe fn from_current<R: RegisterAccess>(mapper: &'m M, regs: &R) -> Self {
        let cr3 = unsafe { regs.read_cr3() };
        Self::from_root(mapper, cr3.pml4_phys())
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The target space must map the executing code, the stack and every
    /// structure the kernel touches next.
    #[inline]
    pub unsafe fn activate<R: RegisterAccess>(&self, regs: &R) {
        unsafe { regs.write_cr3(Cr3::from_pml4_phys(self.root, false, false)) }
    }

    /// Physical address of the root table (the page-table base).
    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Map `[va, va + size)` onto `[pa, pa + size)` with 4 KiB pages.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when a needed table cannot be allocated;
    /// tables created before the failure stay in place.
    ///
    /// # Panics
    /// If `va`, `pa` or `size` is not 4 KiB-aligned, or the range wraps
    /// around the address space or is not canonical.
    pub fn map_range<A: TableAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        self.map_range_with::<Size4K, A>(alloc, va, size, pa, flags)
    }

    /// Map `[va, va + size)` onto `[pa, pa + size)` with pages of size `S`.
    ///
    /// # Errors
    /// See [`map_range`](Self::map_range); additionally [`MapError::Conflict`]
    /// when a leaf of a different size is in the way.
    ///
    /// # Panics
    /// If `va`, `pa` or `size` is not aligned to `S`, or the range wraps
    /// around the address space or is not canonical.
    pub fn map_range_with<S: PageSize, A: TableAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        assert!(va.is_aligned::<S>(), "misaligned virtual base {va} for {} pages", S::as_str());
        assert!(pa.is_aligned::<S>(), "misaligned physical base {pa} for {} pages", S::as_str());
        assert!(size.is_multiple_of(S::SIZE), "size {size:#x} is not a multiple of {}", S::as_str());
        if size == 0 {
            return Ok(());
        }
        let last = va
            .as_u64()
            .checked_add(size - 1)
            .unwrap_or_else(|| panic!("range at {va} of {size:#x} bytes wraps"));
        assert!(
            va.is_canonical() && VirtualAddress::new(last).is_canonical() && va.as_u64() >> 63 == last >> 63,
            "range at {va} of {size:#x} bytes leaves its canonical half"
        );

        let req = MapRequest {
            last,
            delta: pa.as_u64().wrapping_sub(va.as_u64()),
            leaf_level: S::LEVEL,
            flags,
        };
        self.map_level(alloc, self.root, LEVELS - 1, va.as_u64(), req)
    }

    /// Map every entry of the table at `table` whose window intersects
    /// `[first, req.last]`.
    fn map_level<A: TableAlloc>(
        &self,
        alloc: &mut A,
        table: PhysicalAddress,
        level: usize,
        first: u64,
        req: MapRequest,
    ) -> Result<(), MapError> {
        let shift = level_shift(level);
        let window = entry_window(level);
        let table_span_mask = (window << 9).wrapping_sub(1);
        let table_base = first & !table_span_mask;

        // The caller clamped the range to this table's span.
        let last = req.last.min(table_base | table_span_mask);
        let first_index = VirtualAddress::new(first).table_index(shift);
        let last_index = VirtualAddress::new(last).table_index(shift);
        debug_assert!(first_index <= last_index && last_index < ENTRIES);

        for index in first_index..=last_index {
            let entry_first = table_base + ((index as u64) << shift);
            let entry_last = entry_first + (window - 1);
            let sub_first = first.max(entry_first);
            let sub_last = last.min(entry_last);
            debug_assert!(sub_first <= sub_last);

            let entry = self.table(table).get(index);
            if level == req.leaf_level {
                if entry.is_table() && level > 0 {
                    return Err(MapError::Conflict {
                        va: VirtualAddress::new(entry_first),
                        level,
                    });
                }
                let leaf = PageTableEntry::new()
                    .with_present(true)
                    .with_writable(req.flags.writable)
                    .with_user_access(req.flags.user)
                    .with_large_page(level > 0)
                    .with_physical_address(PhysicalAddress::new(
                        sub_first.wrapping_add(req.delta),
                    ));
                self.table(table).set(index, leaf);
                continue;
            }

            let next = if entry.is_table() {
                entry.physical_address()
            } else if entry.present() {
                return Err(MapError::Conflict {
                    va: VirtualAddress::new(entry_first),
                    level,
                });
            } else {
                let next = Self::new_table(self.mapper, alloc, level - 1)?;
                self.table(table)
                    .set(index, PageTableEntry::next_table(next));
                next
            };

            self.map_level(alloc, next, level - 1, sub_first, req)?;
        }
        Ok(())
    }

    /// Translate `va` to its physical address if mapped.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in (0..LEVELS).rev() {
            let entry = self.table(table).get(va.table_index(level_shift(level)));
            if !entry.present() {
                return None;
            }
            if level == 0 || entry.large_page() {
                let offset = va.as_u64() & (entry_window(level) - 1);
                return Some(entry.physical_address() + offset);
            }
            table = entry.physical_address();
        }
        None
    }

    /// Read a single entry, e.g. for inspection in tests and diagnostics.
    ///
    /// Returns `None` if the walk to `level` hits a missing table or a huge leaf.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress, level: usize) -> Option<PageTableEntry> {
        let mut table = self.root;
        for l in (level + 1..LEVELS).rev() {
            let entry = self.table(table).get(va.table_index(level_shift(l)));
            if !entry.is_table() {
                return None;
            }
            table = entry.physical_address();
        }
        Some(self.table(table).get(va.table_index(level_shift(level))))
    }

    fn new_table<A: TableAlloc>(
        mapper: &M,
        alloc: &mut A,
        level: usize,
    ) -> Result<PhysicalAddress, MapError> {
        let pa = alloc.alloc_table().ok_or(MapError::OutOfMemory { level })?;
        assert!(pa.is_aligned::<Size4K>(), "misaligned page table at {pa}");
        // SAFETY: the allocator handed us an exclusive, mapped 4 KiB page.
        let table: &mut PageTable = unsafe { mapper.phys_to_mut(pa) };
        table.zero();
        trace!("new level-{level} page table at {pa}");
        Ok(pa)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: every table reachable from the root was created zeroed by
        // `new_table` or handed to us via `from_root`; each use is short-lived.
        unsafe { self.mapper.phys_to_mut(pa) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};
    use kernel_memory_addresses::{Size1G, Size2M};
    use kernel_registers::{ControlRegister, MockRegisters};

    const GIB: u64 = 1 << 30;
    const MIB: u64 = 1 << 20;

    fn setup(frames: usize) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(frames);
        let alloc = BumpAlloc::new(0, (frames as u64) << 12);
        (phys, alloc)
    }

    #[test]
    fn create_zeroes_the_root() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        assert_eq!(aspace.root().as_u64(), 0);
        let root: &mut PageTable = unsafe { phys.phys_to_mut(aspace.root()) };
        assert_eq!(root.present_count(), 0);
    }

    #[test]
    fn map_one_4k_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xffff_8000_0000_0000); // arbitrary higher-half VA
        let pa = PhysicalAddress::new(0x0030_0000);
        aspace
            .map_range(&mut alloc, va, 4096, pa, MappingFlags::KERNEL_RW)
            .unwrap();

        // root + one table per lower level
        assert_eq!(alloc.allocated, 4);
        for level in 1..LEVELS {
            let e = aspace.entry(va, level).unwrap();
            assert!(e.is_table());
            assert!(e.writable() && e.user_access());
        }
        let leaf = aspace.entry(va, 0).unwrap();
        assert!(leaf.present());
        assert!(leaf.writable());
        assert!(!leaf.user_access());
        assert!(!leaf.large_page());
        assert_eq!(leaf.physical_address(), pa);
        assert_eq!(aspace.translate(va + 0x123), Some(pa + 0x123));
        assert_eq!(aspace.translate(va + 4096), None);
    }

    #[test]
    fn map_one_gib_with_4k_pages() {
        // root + PDPT + PD + 512 PTs
        let (phys, mut alloc) = setup(515);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x40_0000_0000); // 256 GiB, 1 GiB aligned
        let pa = PhysicalAddress::new(0x1_0000_0000);
        aspace
            .map_range(&mut alloc, va, GIB, pa, MappingFlags::USER_RW)
            .unwrap();
        assert_eq!(alloc.allocated, 515);

        let pd = aspace.entry(va, 2).unwrap();
        assert!(pd.is_table());
        for i in 0..512u64 {
            let e = aspace.entry(va + i * 2 * MIB, 1).unwrap();
            assert!(e.is_table(), "PD entry {i} not present");
        }
        for off in [0, 4096, 2 * MIB, 511 * 2 * MIB + 511 * 4096] {
            let leaf = aspace.entry(va + off, 0).unwrap();
            assert!(leaf.present() && leaf.user_access() && leaf.writable());
            assert_eq!(leaf.physical_address(), pa + off);
        }
        // Neighbours stay unmapped.
        assert_eq!(aspace.translate(va + GIB), None);
    }

    #[test]
    fn range_straddling_table_boundaries() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();

        // Three pages ending one page past a 2 MiB boundary.
        let va = VirtualAddress::new(2 * MIB - 2 * 4096);
        let pa = PhysicalAddress::new(0x80_0000);
        aspace
            .map_range(&mut alloc, va, 3 * 4096, pa, MappingFlags::KERNEL_RW)
            .unwrap();

        // root, PDPT, PD, two PTs
        assert_eq!(alloc.allocated, 5);
        for i in 0..3u64 {
            assert_eq!(aspace.translate(va + i * 4096), Some(pa + i * 4096));
        }
        assert_eq!(aspace.translate(va + 3 * 4096), None);
        assert_eq!(aspace.translate(VirtualAddress::new(va.as_u64() - 4096)), None);
    }

    #[test]
    fn repeated_mapping_reuses_tables() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x1000_0000);

        aspace
            .map_range(&mut alloc, va, 4096, PhysicalAddress::new(0x5000), MappingFlags::KERNEL_RW)
            .unwrap();
        let after_first = alloc.allocated;
        aspace
            .map_range(&mut alloc, va + 4096, 4096, PhysicalAddress::new(0x9000), MappingFlags::KERNEL_RW)
            .unwrap();
        assert_eq!(alloc.allocated, after_first);
        assert_eq!(aspace.translate(va + 4096), Some(PhysicalAddress::new(0x9000)));
    }

    #[test]
    fn map_2m_sets_ps_bit() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xffff_8000_2000_0000);
        let pa = PhysicalAddress::new(0x0400_0000);
        aspace
            .map_range_with::<Size2M, _>(&mut alloc, va, 4 * MIB, pa, MappingFlags::KERNEL_RW)
            .unwrap();

        // root, PDPT, PD; no leaf tables
        assert_eq!(alloc.allocated, 3);
        let pde = aspace.entry(va + 2 * MIB, 1).unwrap();
        assert!(pde.present() && pde.large_page() && pde.writable());
        assert_eq!(pde.physical_address(), pa + 2 * MIB);
        assert_eq!(aspace.entry(va, 0), None);
        assert_eq!(aspace.translate(va + 0x12_3456), Some(pa + 0x12_3456));
    }

    #[test]
    fn identity_map_with_1g_pages() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();

        aspace
            .map_range_with::<Size1G, _>(
                &mut alloc,
                VirtualAddress::new(0),
                4 * GIB,
                PhysicalAddress::new(0),
                MappingFlags::KERNEL_RW,
            )
            .unwrap();

        assert_eq!(alloc.allocated, 2);
        let e = aspace.entry(VirtualAddress::new(3 * GIB), 2).unwrap();
        assert!(e.large_page());
        let probe = VirtualAddress::new(3 * GIB + 0x1234_5678);
        assert_eq!(aspace.translate(probe).map(PhysicalAddress::as_u64), Some(probe.as_u64()));
    }

    #[test]
    fn small_page_under_huge_leaf_conflicts() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        aspace
            .map_range_with::<Size2M, _>(&mut alloc, va, 2 * MIB, PhysicalAddress::new(0), MappingFlags::KERNEL_RW)
            .unwrap();

        let err = aspace
            .map_range(&mut alloc, va + 4096, 4096, PhysicalAddress::new(0x1000), MappingFlags::KERNEL_RW)
            .unwrap_err();
        assert_eq!(err, MapError::Conflict { va, level: 1 });
    }

    #[test]
    fn huge_leaf_over_table_conflicts() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        aspace
            .map_range(&mut alloc, va, 4096, PhysicalAddress::new(0), MappingFlags::KERNEL_RW)
            .unwrap();

        let err = aspace
            .map_range_with::<Size2M, _>(&mut alloc, va, 2 * MIB, PhysicalAddress::new(0), MappingFlags::KERNEL_RW)
            .unwrap_err();
        assert_eq!(err, MapError::Conflict { va, level: 1 });
    }

    #[test]
    fn out_of_memory_names_the_level() {
        let (phys, mut alloc) = setup(2);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let err = aspace
            .map_range(&mut alloc, VirtualAddress::new(0), 4096, PhysicalAddress::new(0), MappingFlags::KERNEL_RW)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory { level: 1 });
    }

    #[test]
    fn zero_size_is_a_no_op() {
        let (phys, mut alloc) = setup(1);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        aspace
            .map_range(&mut alloc, VirtualAddress::new(0), 0, PhysicalAddress::new(0), MappingFlags::KERNEL_RW)
            .unwrap();
        assert_eq!(alloc.allocated, 1);
    }

    #[test]
    #[should_panic(expected = "misaligned physical base")]
    fn misaligned_physical_base_is_fatal() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let _ = aspace.map_range(
            &mut alloc,
            VirtualAddress::new(0),
            4096,
            PhysicalAddress::new(0x123),
            MappingFlags::KERNEL_RW,
        );
    }

    #[test]
    #[should_panic(expected = "misaligned virtual base")]
    fn misaligned_virtual_base_is_fatal_for_huge_pages() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let _ = aspace.map_range_with::<Size2M, _>(
            &mut alloc,
            VirtualAddress::new(4096),
            2 * MIB,
            PhysicalAddress::new(0),
            MappingFlags::KERNEL_RW,
        );
    }

    #[test]
    #[should_panic(expected = "leaves its canonical half")]
    fn range_across_the_lower_half_end_is_fatal() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let _ = aspace.map_range(
            &mut alloc,
            VirtualAddress::new(0x0000_7fff_ffff_f000),
            2 * 4096,
            PhysicalAddress::new(0),
            MappingFlags::KERNEL_RW,
        );
    }

    #[test]
    #[should_panic(expected = "leaves its canonical half")]
    fn non_canonical_base_is_fatal() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let _ = aspace.map_range(
            &mut alloc,
            VirtualAddress::new(0x0000_8000_0000_0000),
            4096,
            PhysicalAddress::new(0),
            MappingFlags::KERNEL_RW,
        );
    }

    #[test]
    fn activate_and_from_current_go_through_cr3() {
        let (phys, mut alloc) = setup(4);
        let _ = alloc.alloc_table(); // push the root off frame 0
        let aspace = AddressSpace::create(&phys, &mut alloc).unwrap();
        let regs = MockRegisters::new();

        unsafe { aspace.activate(&regs) };
        assert_eq!(regs.cr3_writes(), vec![0x1000]);

        let current = unsafe { AddressSpace::from_current(&phys, &regs) };
        assert_eq!(current.root(), aspace.root());

        let preset = MockRegisters::new().with_cr(ControlRegister::Cr3, 0x2000);
        let current = unsafe { AddressSpace::from_current(&phys, &preset) };
        assert_eq!(current.root().as_u64(), 0x2000);
    }
}
