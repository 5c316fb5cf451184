//! # Kernel Boot Information

use kernel_memory_addresses::PhysicalAddress;

/// Fixed description of the physical memory available to the frame pool.
///
/// Handed over by the bootloader. Keep this `#[repr(C)]` and prefer
/// fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootMemoryRegion {
    /// Physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub size: u64,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Exclusive end of the region, saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.saturating_add(self.size))
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}
