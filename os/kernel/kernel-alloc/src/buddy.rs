//! # Buddy physical frame allocator
//!
//! Manages `2^max_order` contiguous 4 KiB frames starting at a frame-aligned
//! base. Blocks of order `k` span `2^k` frames and start at a multiple of
//! their own size relative to the base.
//!
//! Block state is tracked over a perfect binary tree numbered heap-style:
//! the whole span is node `1`, the children of node `n` are `2n` and
//! `2n + 1`, so a block of order `k` at byte offset `off` is node
//! `2^(max_order - k) + (off >> (12 + k))`.
//!
//! * `need_merge[n]` holds the XOR of "child is free" for both children of
//!   `n`. Freeing a block flips its parent's bit; reading `0` afterwards means
//!   the buddy is free as well and the two coalesce.
//! * `is_split[n]` is set while block `n` is divided into its children. It
//!   lets [`BuddyAllocator::free_frame`] recover the order of a block from its
//!   address alone.
//!
//! Free blocks of each order sit on a circular doubly linked list.

mod free_list;

use crate::bitmap::Bitmap;
use free_list::FreeLists;
use kernel_info::memory::{FRAME_SHIFT, FRAME_SIZE};
use kernel_memory_addresses::PhysicalAddress;
use log::{debug, trace, warn};

/// Largest order a single allocator accepts (4 GiB of frames).
pub const MAX_SUPPORTED_ORDER: u8 = 20;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuddyError {
    #[error("order {order} exceeds the maximum order {max}")]
    InvalidOrder { order: u8, max: u8 },
    #[error("no free block of order {order}")]
    OutOfMemory { order: u8 },
    #[error("{0} is not a frame managed by this allocator")]
    ForeignAddress(PhysicalAddress),
    #[error("allocator base {0} is not frame aligned")]
    MisalignedBase(PhysicalAddress),
}

#[derive(Debug, Clone)]
pub struct BuddyAllocator {
    base: PhysicalAddress,
    max_order: u8,
    free_lists: FreeLists,
    need_merge: Bitmap,
    is_split: Bitmap,
    free_frames: u64,
}

impl BuddyAllocator {
    /// An allocator whose whole span is one free block of `max_order`.
    ///
    /// The frames themselves are never touched; all bookkeeping lives on the
    /// kernel heap.
    ///
    /// # Errors
    /// [`BuddyError::MisalignedBase`] if `base` is not 4 KiB aligned,
    /// [`BuddyError::InvalidOrder`] if `max_order` exceeds
    /// [`MAX_SUPPORTED_ORDER`].
    pub fn new(base: PhysicalAddress, max_order: u8) -> Result<Self, BuddyError> {
        if !base.is_aligned_to(FRAME_SIZE) {
            return Err(BuddyError::MisalignedBase(base));
        }
        if max_order > MAX_SUPPORTED_ORDER {
            return Err(BuddyError::InvalidOrder {
                order: max_order,
                max: MAX_SUPPORTED_ORDER,
            });
        }

        let nodes = 2usize << max_order;
        let mut free_lists = FreeLists::new(max_order);
        free_lists.push(max_order, base);
        debug!("buddy: {} frames at {base}, max order {max_order}", 1u64 << max_order);

        Ok(Self {
            base,
            max_order,
            free_lists,
            need_merge: Bitmap::new(nodes),
            is_split: Bitmap::new(nodes),
            free_frames: 1 << max_order,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn max_order(&self) -> u8 {
        self.max_order
    }

    /// Bytes under management.
    #[inline]
    #[must_use]
    pub const fn span(&self) -> u64 {
        FRAME_SIZE << self.max_order
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: PhysicalAddress) -> bool {
        address.as_u64() >= self.base.as_u64() && address.as_u64() - self.base.as_u64() < self.span()
    }

    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_frames << FRAME_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn allocated_bytes(&self) -> u64 {
        self.span() - self.free_bytes()
    }

    /// Number of free blocks of exactly `order`.
    #[must_use]
    pub fn free_blocks(&self, order: u8) -> usize {
        if order > self.max_order {
            0
        } else {
            self.free_lists.len(order)
        }
    }

    /// Whether everything has coalesced back into the single top block.
    #[must_use]
    pub fn is_fully_merged(&self) -> bool {
        self.free_lists.len(self.max_order) == 1 && (0..self.max_order).all(|k| self.free_lists.is_empty(k))
    }

    /// Allocate a block of `2^order` frames aligned to its own size.
    ///
    /// Takes the smallest free block of at least `order` and splits it down,
    /// filing each right half one order lower.
    ///
    /// # Errors
    /// [`BuddyError::InvalidOrder`] if `order > max_order`,
    /// [`BuddyError::OutOfMemory`] if no block is large enough.
    pub fn allocate_frame(&mut self, order: u8) -> Result<PhysicalAddress, BuddyError> {
        if order > self.max_order {
            warn!("buddy: order {order} requested, max is {}", self.max_order);
            return Err(BuddyError::InvalidOrder {
                order,
                max: self.max_order,
            });
        }

        let mut k = (order..=self.max_order)
            .find(|&k| !self.free_lists.is_empty(k))
            .ok_or(BuddyError::OutOfMemory { order })?;
        let address = self
            .free_lists
            .pop(k)
            .ok_or(BuddyError::OutOfMemory { order })?;
        if k < self.max_order {
            self.need_merge.toggle(self.node(address, k) >> 1);
        }

        while k > order {
            let node = self.node(address, k);
            self.is_split.set(node, true);
            k -= 1;
            self.free_lists.push(k, address + (FRAME_SIZE << k));
            // Left half is handed on, right half is free.
            self.need_merge.toggle(node);
        }

        self.free_frames -= 1 << order;
        trace!("buddy: order {order} block at {address}");
        Ok(address)
    }

    /// Return a block handed out by [`allocate_frame`](Self::allocate_frame).
    ///
    /// The block's order is recovered from the split bitmap, then the block
    /// coalesces with its buddy for as long as the buddy is free.
    ///
    /// # Errors
    /// [`BuddyError::ForeignAddress`] if `address` is outside the span or not
    /// frame aligned.
    ///
    /// # Panics
    /// If the bitmaps contradict the free lists, which means `address` was
    /// not allocated or was already freed.
    pub fn free_frame(&mut self, address: PhysicalAddress) -> Result<(), BuddyError> {
        if !self.contains(address) || !address.is_aligned_to(FRAME_SIZE) {
            return Err(BuddyError::ForeignAddress(address));
        }

        let order = self.order_of(address);
        debug_assert!(
            !self.free_lists.contains(order, address),
            "buddy: double free of {address}"
        );
        if order < self.max_order {
            assert!(
                self.is_split.get(self.node(address, order + 1)),
                "buddy: parent of {address} at order {order} is not split"
            );
        }
        // An allocated block that was never split has both halves in use.
        if order > 0 {
            assert!(
                !self.need_merge.get(self.node(address, order)),
                "buddy: {address} at order {order} has a free half"
            );
        }
        self.free_frames += 1 << order;

        let mut address = address;
        let mut k = order;
        while k < self.max_order {
            let parent = self.node(address, k) >> 1;
            if self.need_merge.toggle(parent) {
                break;
            }
            let buddy = self.buddy_of(address, k);
            assert!(
                self.free_lists.remove(k, buddy),
                "buddy: {buddy} should be free at order {k}"
            );
            self.is_split.set(parent, false);
            address = address.min(buddy);
            k += 1;
        }
        self.free_lists.push(k, address);
        trace!("buddy: freed order {order} at {address}, filed at order {k}");
        Ok(())
    }

    /// Order of the allocated block at `address`: one below the smallest
    /// split ancestor, bounded by the address's alignment.
    fn order_of(&self, address: PhysicalAddress) -> u8 {
        let frame = (address - self.base) >> FRAME_SHIFT;
        #[allow(clippy::cast_possible_truncation)]
        let bound = if frame == 0 {
            self.max_order
        } else {
            (frame.trailing_zeros() as u8).min(self.max_order)
        };
        (1..=bound)
            .find(|&k| self.is_split.get(self.node(address, k)))
            .map_or(bound, |k| k - 1)
    }

    /// Tree node of the order-`order` block at `address`.
    #[inline]
    fn node(&self, address: PhysicalAddress, order: u8) -> usize {
        let offset = address - self.base;
        #[allow(clippy::cast_possible_truncation)]
        let index = (offset >> (FRAME_SHIFT + u32::from(order))) as usize;
        (1usize << (self.max_order - order)) + index
    }

    #[inline]
    fn buddy_of(&self, address: PhysicalAddress, order: u8) -> PhysicalAddress {
        let offset = (address - self.base) ^ (FRAME_SIZE << order);
        self.base + offset
    }
}
