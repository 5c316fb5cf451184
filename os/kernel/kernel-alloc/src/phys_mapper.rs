//! # Fixed-offset [`PhysMapper`]
//!
//! Page tables are reached through a linear mapping of physical memory. With
//! the kernel's higher-half direct map (HHDM), physical address `pa` is
//! visible at `HHDM_BASE + pa`; host tests and early boot use the identity
//! mapping, i.e. an offset of zero.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::OffsetPhysMapper;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//!
//! let mapper = OffsetPhysMapper::new(0xffff_8880_0000_0000);
//! let pa = PhysicalAddress::new(0x1234_0000);
//! assert_eq!(mapper.phys_to_virt(pa), VirtualAddress::new(0xffff_8880_1234_0000));
//! assert_eq!(mapper.virt_to_phys(mapper.phys_to_virt(pa)), Some(pa));
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a linear map at a constant offset.
///
/// # Safety
/// Dereferencing through this mapper requires the linear map to be present
/// and to cover the referenced physical range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl Default for OffsetPhysMapper {
    fn default() -> Self {
        Self::hhdm()
    }
}

impl OffsetPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's higher-half direct map.
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(HHDM_BASE)
    }

    /// Physical memory is addressed directly.
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }

    /// Physical address behind `va`, if `va` lies in the linear map.
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match va.as_u64().checked_sub(self.offset) {
            Some(pa) => Some(PhysicalAddress::new(pa)),
            None => None,
        }
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.phys_to_virt(pa).as_mut_ptr::<T>();
        // SAFETY: caller guarantees the linear map covers `pa`.
        unsafe { &mut *va }
    }
}
