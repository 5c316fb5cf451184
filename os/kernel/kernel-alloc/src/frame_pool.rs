//! # Growable frame pool
//!
//! Hands out physical frames for user mappings from a list of
//! [`BuddyAllocator`]s, each covering [`USER_POOL_SPAN`] bytes at order
//! [`USER_POOL_ORDER`]. Instances are carved from the boot memory region on
//! demand: a new one is appended only when every existing instance fails.

use crate::buddy::{BuddyAllocator, BuddyError};
use alloc::vec::Vec;
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::{USER_POOL_ORDER, USER_POOL_SPAN};
use kernel_memory_addresses::{PhysicalAddress, Size4K};
use kernel_sync::YieldSpinMutex;
use log::{debug, warn};

#[derive(Debug)]
pub struct FramePool {
    region: BootMemoryRegion,
    /// Base of the next instance.
    next_base: PhysicalAddress,
    instances: Vec<BuddyAllocator>,
}

impl FramePool {
    /// An empty pool drawing from `region`. No instance exists yet.
    #[must_use]
    pub const fn new(region: BootMemoryRegion) -> Self {
        Self {
            region,
            next_base: region.start().align_up::<Size4K>(),
            instances: Vec::new(),
        }
    }

    #[must_use]
    pub const fn region(&self) -> BootMemoryRegion {
        self.region
    }

    #[must_use]
    pub fn instances(&self) -> &[BuddyAllocator] {
        &self.instances
    }

    /// Bytes currently managed by all instances.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.instances.iter().map(BuddyAllocator::span).sum()
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.instances.iter().map(BuddyAllocator::free_bytes).sum()
    }

    /// Allocate `2^order` contiguous frames.
    ///
    /// # Errors
    /// [`BuddyError::InvalidOrder`] if `order` exceeds [`USER_POOL_ORDER`],
    /// [`BuddyError::OutOfMemory`] once the boot region cannot hold another
    /// instance.
    pub fn allocate_frame(&mut self, order: u8) -> Result<PhysicalAddress, BuddyError> {
        if order > USER_POOL_ORDER {
            warn!("frame pool: order {order} requested, max is {USER_POOL_ORDER}");
            return Err(BuddyError::InvalidOrder {
                order,
                max: USER_POOL_ORDER,
            });
        }
        if let Some(pa) = self
            .instances
            .iter_mut()
            .find_map(|buddy| buddy.allocate_frame(order).ok())
        {
            return Ok(pa);
        }
        self.grow(order)?.allocate_frame(order)
    }

    /// Return frames to the instance that owns them.
    ///
    /// # Errors
    /// [`BuddyError::ForeignAddress`] if no instance manages `pa`.
    pub fn free_frame(&mut self, pa: PhysicalAddress) -> Result<(), BuddyError> {
        self.instances
            .iter_mut()
            .find(|buddy| buddy.contains(pa))
            .ok_or(BuddyError::ForeignAddress(pa))?
            .free_frame(pa)
    }

    fn grow(&mut self, order: u8) -> Result<&mut BuddyAllocator, BuddyError> {
        let base = self.next_base;
        let end = base
            .checked_add(USER_POOL_SPAN)
            .filter(|end| *end <= self.region.end())
            .ok_or(BuddyError::OutOfMemory { order })?;

        self.instances.push(BuddyAllocator::new(base, USER_POOL_ORDER)?);
        self.next_base = end;
        debug!(
            "frame pool: grew to {} instances, {:#x} bytes",
            self.instances.len(),
            self.capacity()
        );
        self.instances.last_mut().ok_or(BuddyError::OutOfMemory { order })
    }
}

/// [`FramePool`] behind a spin-then-yield lock.
pub struct LockedFramePool {
    inner: YieldSpinMutex<FramePool>,
}

impl LockedFramePool {
    #[must_use]
    pub const fn new(region: BootMemoryRegion) -> Self {
        Self {
            inner: YieldSpinMutex::new(FramePool::new(region)),
        }
    }

    /// # Errors
    /// See [`FramePool::allocate_frame`].
    pub fn allocate_frame(&self, order: u8) -> Result<PhysicalAddress, BuddyError> {
        self.inner.with_lock(|pool| pool.allocate_frame(order))
    }

    /// # Errors
    /// See [`FramePool::free_frame`].
    pub fn free_frame(&self, pa: PhysicalAddress) -> Result<(), BuddyError> {
        self.inner.with_lock(|pool| pool.free_frame(pa))
    }

    /// Run `f` on the pool under the lock.
    pub fn with_pool<U>(&self, f: impl FnOnce(&mut FramePool) -> U) -> U {
        self.inner.with_lock(f)
    }
}
