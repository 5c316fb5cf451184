use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// Models the **common superset** of fields found in all four paging levels.
/// An entry either points to a **next-level table** or, when `large_page` is
/// set at level 1 (2 MiB) or level 2 (1 GiB), directly maps a **huge page**.
/// Level-0 entries always map 4 KiB pages.
///
/// | Bits      | Name              | Meaning |
/// |-----------|-------------------|---------|
/// | 0         | `P`               | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9-11      | OS avail low      | Reserved for OS use |
/// | 12-51     | `addr`            | Physical frame bits [51:12] |
/// | 52-58     | OS avail high     | Reserved for OS use |
/// | 59-62     | `PKU`             | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageTableEntry;
/// let e = PageTableEntry::next_table(PhysicalAddress::new(0x5000));
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.physical_address().as_u64(), 0x5000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6): **leaf only**. Set by the CPU.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// At level 2 (1 GiB) and level 1 (2 MiB): when set, the entry is a leaf.
    /// Must be clear at levels 3 and 0.
    pub large_page: bool,

    /// Global (G, bit 8): **leaf only**.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, phys: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_51_12(phys.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Link to a next-level table.
    ///
    /// Intermediate entries are always present, writable and user-accessible;
    /// the effective permissions are decided at the leaf.
    #[inline]
    #[must_use]
    pub const fn next_table(table: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_physical_address(table)
    }

    /// Whether this entry links to a next-level table.
    #[inline]
    #[must_use]
    pub const fn is_table(&self) -> bool {
        self.present() && !self.large_page()
    }
}
