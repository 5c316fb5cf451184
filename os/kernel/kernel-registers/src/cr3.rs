use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the root page table and cache-control
/// flags for root table walks. Assumes 4 KiB alignment and no PCID.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0-2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for the root table.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for the root table.
    pub pcd: bool,

    /// Bits 5-11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12-51: root table physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52-63: Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Create a `Cr3` value from a root table physical base address.
    ///
    /// # Panics
    /// If `pml4_phys` is not 4 KiB-aligned.
    #[must_use]
    pub const fn from_pml4_phys(pml4_phys: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        assert!(
            pml4_phys.as_u64() & 0xFFF == 0,
            "PML4 base must be 4K-aligned"
        );
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_pml4_base_4k(pml4_phys.as_u64() >> 12)
    }

    /// Return the full physical address of the root table.
    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}
